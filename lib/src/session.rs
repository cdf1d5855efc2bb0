use crate::{
    errors::{self, Error},
    evaluator::{Evaluator, LossTargets, StyleObjective},
    lbfgs::Lbfgs,
    utils::{self, ImageSource},
    vgg::Vgg19,
    Dims, GeneratedImage, Parameters, MIN_DIMENSION,
};
use std::path::Path;

/// Style transfer session.
///
/// Calling `run()` optimizes the combination image and returns it, consuming
/// the session in the process. You can provide a `GeneratorProgress`
/// implementation to get an update with the current image after every outer
/// iteration.
///
/// # Example
/// ```no_run
/// let session = neural_style::Session::builder()
///     .content(&"content_image/freegodness.jpeg")
///     .style(&"style_reference/d1.jpeg")
///     .weights(&"weights/vgg19.safetensors")
///     .iterations(1)
///     .build().expect("failed to build session");
///
/// let generated = session.run(None).expect("failed to transfer style");
/// generated.save("my_generated_img.png").expect("failed to save image");
/// ```
pub struct Session {
    network: Vgg19,
    content: Vec<f64>,
    style: Vec<f64>,
    dims: Dims,
    params: Parameters,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// The size every input was resized to, and the size of the output
    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// Runs the optimizer for the configured number of iterations and
    /// outputs the final image.
    pub fn run(self, mut progress: Option<Box<dyn GeneratorProgress>>) -> Result<GeneratedImage, Error> {
        let threads = self.params.thread_count();
        let iterations = self.params.iterations as usize;
        let max_evaluations = self.params.max_evaluations as usize;

        log::debug!(
            "transferring style at {}x{} for {} iterations on {} threads",
            self.dims.width,
            self.dims.height,
            iterations,
            threads
        );

        let targets = LossTargets::new(&self.network, &self.content, &self.style, self.dims, threads);
        let mut evaluator = Evaluator::new(StyleObjective::new(
            &self.network,
            targets,
            self.dims,
            threads,
        ));
        let solver = Lbfgs::with_max_evaluations(max_evaluations);

        let mut x = self.content;
        let mut image = utils::postprocess(&x, self.dims);
        let mut loss = f64::NAN;

        for i in 0..iterations {
            let min = solver.minimize(&mut evaluator, x)?;
            x = min.x;
            loss = min.value;

            // only the last of these survives the loop
            image = utils::postprocess(&x, self.dims);

            log::debug!(
                "iteration {}/{}: loss {:.6e} after {} evaluations ({:?})",
                i + 1,
                iterations,
                loss,
                min.evaluations,
                min.stop
            );

            if let Some(ref mut progress) = progress {
                progress.update(ProgressUpdate {
                    image: &image,
                    total: ProgressStat {
                        current: i + 1,
                        total: iterations,
                    },
                    stage: ProgressStat {
                        current: min.evaluations,
                        total: max_evaluations,
                    },
                    loss,
                });
            }
        }

        Ok(GeneratedImage { image, loss })
    }
}

/// Where the network weights come from
enum NetworkSource<'a> {
    Path(&'a Path),
    Loaded(Vgg19),
}

/// Builds a session by setting parameters and adding input images, calling
/// `build` will load the images and the network and check that the
/// parameters are usable
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    network: Option<NetworkSource<'a>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose structure is preserved. The output starts out as this
    /// image, and its aspect ratio determines the output size.
    pub fn content<I: Into<ImageSource<'a>>>(mut self, content: I) -> Self {
        self.content = Some(content.into());
        self
    }

    /// The image whose textures and colors are transferred. It is resized to
    /// the output size, ignoring its own aspect ratio.
    pub fn style<I: Into<ImageSource<'a>>>(mut self, style: I) -> Self {
        self.style = Some(style.into());
        self
    }

    /// Path to a `safetensors` file holding the VGG19 convolution weights
    pub fn weights<P: AsRef<Path> + ?Sized>(mut self, path: &'a P) -> Self {
        self.network = Some(NetworkSource::Path(path.as_ref()));
        self
    }

    /// Uses an already loaded network
    pub fn network(mut self, network: Vgg19) -> Self {
        self.network = Some(NetworkSource::Loaded(network));
        self
    }

    /// The number of outer iterations, each of which is a fresh L-BFGS run
    /// continuing from the previous result.
    ///
    /// Default: 500
    pub fn iterations(mut self, count: u32) -> Self {
        self.params.iterations = count;
        self
    }

    /// The number of loss/gradient evaluations each outer iteration may use.
    ///
    /// Default: 20
    pub fn max_evaluations(mut self, count: u32) -> Self {
        self.params.max_evaluations = count;
        self
    }

    /// Height of the output, the width follows from the content image's
    /// aspect ratio.
    ///
    /// Default: 400
    pub fn target_height(mut self, height: u32) -> Self {
        self.params.target_height = height;
        self
    }

    /// Controls the maximum number of threads the convolutions are spread
    /// over. The output doesn't depend on this.
    ///
    /// Default: The number of logical cores on this system.
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or
    /// inputs were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.check_parameters_validity()?;

        let content = self.content.ok_or(Error::MissingInput("content image"))?;
        let style = self.style.ok_or(Error::MissingInput("style image"))?;
        let network = self.network.ok_or(Error::MissingInput("network"))?;

        let content = utils::load_dynamic_image(content)?;
        let original = {
            use image::GenericImageView;
            Dims::new(content.width(), content.height())
        };

        let dims = utils::scaled_dims(original, self.params.target_height);
        if dims.width < MIN_DIMENSION || dims.height < MIN_DIMENSION {
            return Err(Error::ImageTooSmall(dims));
        }

        let content = utils::preprocess(&utils::resize_exact(&content, dims));
        let style = utils::load_preprocessed(style, dims)?;

        let network = match network {
            NetworkSource::Path(path) => Vgg19::load(path)?,
            NetworkSource::Loaded(network) => network,
        };

        Ok(Session {
            network,
            content,
            style,
            dims,
            params: self.params,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        if self.params.iterations == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: u32::MAX as f32,
                value: 0.0,
                name: "iterations",
            }));
        }

        if self.params.max_evaluations == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: u32::MAX as f32,
                value: 0.0,
                name: "max-evaluations",
            }));
        }

        if self.params.target_height < MIN_DIMENSION {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: MIN_DIMENSION as f32,
                max: u32::MAX as f32,
                value: self.params.target_height as f32,
                name: "target-height",
            }));
        }

        if let Some(max_count) = self.params.max_thread_count {
            if max_count == 0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 1.0,
                    max: 1024.0,
                    value: max_count as f32,
                    name: "max-thread-count",
                }));
            }
        }

        Ok(())
    }
}

/// Helper struct for passing progress information to external callers
pub struct ProgressStat {
    /// The current amount of work that has been done
    pub current: usize,
    /// The total amount of work to do
    pub total: usize,
}

/// The state of the optimization after an outer iteration
pub struct ProgressUpdate<'a> {
    /// The current combination image
    pub image: &'a image::RgbImage,
    /// Outer iterations completed
    pub total: ProgressStat,
    /// Evaluations used by the iteration that just finished, out of its budget
    pub stage: ProgressStat,
    /// The objective at the current image
    pub loss: f64,
}

/// Allows the optimizer to update external callers with the current
/// progress of the style transfer
pub trait GeneratorProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> GeneratorProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}
