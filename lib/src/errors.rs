use crate::Dims;
use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

/// The loss evaluator hands out a gradient only for the point it last
/// computed a loss for, so calls must strictly alternate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// `grads` was called without a preceding `loss`
    GradsBeforeLoss,
    /// `loss` was called again before the pending gradient was consumed
    LossTwice,
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GradsBeforeLoss => f.write_str("gradients requested before the loss was evaluated"),
            Self::LossTwice => f.write_str(
                "loss evaluated twice without the gradients of the first evaluation being consumed",
            ),
        }
    }
}

#[derive(Debug)]
pub enum WeightsError {
    /// The container itself could not be parsed
    Format(safetensors::SafeTensorError),
    /// A tensor required by the network is not in the file
    MissingTensor(String),
    /// A tensor has a shape incompatible with its position in the network
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// Only f32 weights are supported
    UnsupportedDtype { name: String, dtype: String },
}

impl fmt::Display for WeightsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format(err) => write!(f, "failed to parse weights: {}", err),
            Self::MissingTensor(name) => write!(f, "weights are missing tensor '{}'", name),
            Self::ShapeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "tensor '{}' has shape {:?}, but {:?} was expected",
                name, actual, expected
            ),
            Self::UnsupportedDtype { name, dtype } => write!(
                f,
                "tensor '{}' is stored as {}, only F32 is supported",
                name, dtype
            ),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// The network weights could not be loaded
    Weights(WeightsError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// The working size is too small to survive the four pooling stages
    /// between the input and the deepest layer used by the loss
    ImageTooSmall(Dims),
    /// A pixel vector of the wrong length was handed to the evaluator
    DimensionMismatch { expected: usize, actual: usize },
    /// The loss/gradient calling convention was broken
    Protocol(ProtocolViolation),
    /// The session was built without one of its required inputs
    MissingInput(&'static str),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Weights(WeightsError::Format(err)) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::Io(io) => write!(f, "{}", io),
            Self::Weights(we) => write!(f, "{}", we),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::ImageTooSmall(dims) => write!(
                f,
                "the working size {}x{} is too small, both dimensions must be at least {}",
                dims.width,
                dims.height,
                crate::MIN_DIMENSION
            ),
            Self::DimensionMismatch { expected, actual } => write!(
                f,
                "expected a pixel vector of {} values, but got {}",
                expected, actual
            ),
            Self::Protocol(pv) => write!(f, "{}", pv),
            Self::MissingInput(which) => write!(f, "no {} was provided", which),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(se: safetensors::SafeTensorError) -> Self {
        Self::Weights(WeightsError::Format(se))
    }
}

impl From<WeightsError> for Error {
    fn from(we: WeightsError) -> Self {
        Self::Weights(we)
    }
}

impl From<ProtocolViolation> for Error {
    fn from(pv: ProtocolViolation) -> Self {
        Self::Protocol(pv)
    }
}
