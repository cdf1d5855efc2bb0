mod progress_window;

use progress_window::ProgressWindow;
use structopt::StructOpt;

use neural_style::{Error, Session};
use std::path::{Path, PathBuf};

const CONTENT_DIR: &str = "content_image";
const STYLE_DIR: &str = "style_reference";
const OUTPUT_DIR: &str = "target_image";

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Transfers the style of one image onto the content of another",
    rename_all = "kebab-case"
)]
struct Opt {
    /// File name of the style image, looked up in `<root>/style_reference`
    #[structopt(long, default_value = "d1.jpeg", parse(from_os_str))]
    style: PathBuf,
    /// File name of the content image, looked up in `<root>/content_image`
    #[structopt(long, default_value = "freegodness.jpeg", parse(from_os_str))]
    content: PathBuf,
    /// The number of optimizer iterations, each of which may evaluate the
    /// network up to 20 times
    #[structopt(long = "i_size", default_value = "20")]
    iterations: u32,
    /// The directory holding `content_image`, `style_reference` and
    /// `target_image`. Defaults to the directory of the executable.
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
    /// Path to the VGG19 weights. Defaults to `<root>/weights/vgg19.safetensors`
    #[structopt(long, parse(from_os_str))]
    weights: Option<PathBuf>,
    /// The maximum number of worker threads used by the convolutions.
    /// Defaults to the logical core count.
    #[structopt(short = "t", long = "threads")]
    max_threads: Option<usize>,
    /// Don't show progress bars
    #[structopt(long)]
    no_progress: bool,
    #[structopt(long = "window")]
    #[cfg(feature = "progress")]
    #[cfg_attr(feature = "progress", structopt(long = "window"))]
    #[cfg_attr(
        feature = "progress",
        doc = "Show a window with the current image after every iteration"
    )]
    show_window: bool,
}

/// Everything a run needs, resolved once from the command line
struct Config {
    content: PathBuf,
    style: PathBuf,
    weights: PathBuf,
    output: PathBuf,
    iterations: u32,
    max_threads: Option<usize>,
    show_progress: bool,
    #[cfg(feature = "progress")]
    show_window: bool,
}

impl Config {
    fn resolve(args: Opt) -> Result<Self, Error> {
        let root = match args.root {
            Some(root) => root,
            None => exe_dir()?,
        };

        let content = root.join(CONTENT_DIR).join(&args.content);
        let style = root.join(STYLE_DIR).join(&args.style);
        let output = root
            .join(OUTPUT_DIR)
            .join(neural_style::output_file_name(&content, &style));
        let weights = args
            .weights
            .unwrap_or_else(|| root.join("weights").join("vgg19.safetensors"));

        Ok(Self {
            content,
            style,
            weights,
            output,
            iterations: args.iterations,
            max_threads: args.max_threads,
            show_progress: !args.no_progress,
            #[cfg(feature = "progress")]
            show_window: args.show_window,
        })
    }
}

/// The directory holding the running executable
fn exe_dir() -> Result<PathBuf, Error> {
    let exe = std::env::current_exe()?;
    exe.parent().map(Path::to_path_buf).ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} has no parent directory", exe.display()),
        ))
    })
}

fn main() {
    env_logger::init();

    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    let config = Config::resolve(Opt::from_args())?;

    // Missing inputs are reported but aren't treated as failures
    if !config.content.is_file() {
        println!("target image not found ");
        return Ok(());
    }

    if !config.style.is_file() {
        println!("style image not found ");
        return Ok(());
    }

    transfer(&config)
}

fn transfer(config: &Config) -> Result<(), Error> {
    log::info!(
        "transferring {} onto {}",
        config.style.display(),
        config.content.display()
    );

    let mut sb = Session::builder()
        .content(&config.content)
        .style(&config.style)
        .weights(&config.weights)
        .iterations(config.iterations);

    if let Some(mt) = config.max_threads {
        sb = sb.max_thread_count(mt);
    }

    let session = sb.build()?;

    let progress: Option<Box<dyn neural_style::GeneratorProgress>> = if config.show_progress {
        let progress = ProgressWindow::new();

        #[cfg(feature = "progress")]
        let progress = {
            if config.show_window {
                progress.with_preview(session.dims())?
            } else {
                progress
            }
        };

        Some(Box::new(progress))
    } else {
        None
    };

    let generated = session.run(progress)?;

    generated.save(&config.output)?;

    log::info!("final loss {:.6e}", generated.loss());
    println!("Image saved as {}", config.output.display());

    Ok(())
}
