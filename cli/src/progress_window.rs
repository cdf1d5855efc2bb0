#[cfg(feature = "progress")]
use neural_style::{Dims, Error};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
#[cfg(feature = "progress")]
use minifb::Window;

pub struct ProgressWindow {
    #[cfg(feature = "progress")]
    window: Option<(Window, Vec<u32>)>,

    total_pb: ProgressBar,
    stage_pb: ProgressBar,

    total_len: usize,
    stage_len: usize,
}

impl ProgressWindow {
    pub fn new() -> Self {
        let multi_pb = MultiProgress::new();
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss {msg}")
            .progress_chars("##-");

        let total_pb = multi_pb.add(ProgressBar::new(100));
        total_pb.set_style(sty);

        let sty = ProgressStyle::default_bar()
            .template(" evaluations {bar:40.cyan/blue} {pos:>2}/{len}")
            .progress_chars("##-");
        let stage_pb = multi_pb.add(ProgressBar::new(100));
        stage_pb.set_style(sty);

        std::thread::spawn(move || {
            let _ = multi_pb.join();
        });

        Self {
            #[cfg(feature = "progress")]
            window: None,
            total_pb,
            stage_pb,
            total_len: 100,
            stage_len: 100,
        }
    }

    #[cfg(feature = "progress")]
    pub fn with_preview(mut self, size: Dims) -> Result<Self, Error> {
        let window = Window::new(
            "Neural Style",
            size.width as usize,
            size.height as usize,
            minifb::WindowOptions::default(),
        )
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        let buffer = vec![0; size.width as usize * size.height as usize];
        self.window = Some((window, buffer));

        Ok(self)
    }
}

impl Drop for ProgressWindow {
    fn drop(&mut self) {
        self.total_pb.finish();
        self.stage_pb.finish();
    }
}

impl neural_style::GeneratorProgress for ProgressWindow {
    fn update(&mut self, update: neural_style::ProgressUpdate<'_>) {
        if update.total.total != self.total_len {
            self.total_len = update.total.total;
            self.total_pb.set_length(self.total_len as u64);
        }

        if update.stage.total != self.stage_len {
            self.stage_len = update.stage.total;
            self.stage_pb.set_length(self.stage_len as u64);
        }

        self.total_pb.set_position(update.total.current as u64);
        self.total_pb.set_message(&format!("{:.4e}", update.loss));
        self.stage_pb.set_position(update.stage.current as u64);

        #[cfg(feature = "progress")]
        {
            if let Some((ref mut window, ref mut buffer)) = self.window {
                if !window.is_open() {
                    return;
                }

                let (width, height) = update.image.dimensions();
                if buffer.len() != width as usize * height as usize {
                    return;
                }

                // minifb wants 0RGB packed into a u32
                for (dst, px) in buffer.iter_mut().zip(update.image.pixels()) {
                    let [r, g, b] = px.0;
                    *dst = u32::from(r) << 16 | u32::from(g) << 8 | u32::from(b);
                }

                // We don't particularly care if this fails
                let _ = window.update_with_buffer(buffer, width as usize, height as usize);
            }
        }
    }
}
