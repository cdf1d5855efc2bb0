// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4
#![allow(unsafe_code)]

//! `neural-style` transfers the look of one image onto the structure of
//! another by optimizing pixels directly.
//!
//! A frozen VGG19 network is used as a feature extractor. The output starts
//! out as the content image and is repeatedly handed to an L-BFGS solver that
//! minimizes a weighted sum of three terms:
//!
//! 1. Content loss, matching the content image's activations at `block5_conv2`
//! 2. Style loss, matching the Gram matrices of the style image's activations
//!    at the first convolution of every block
//! 3. Total variation, keeping neighbouring pixels close
//!
//! First, you build a `Session` via a `SessionBuilder`. Calling `build` loads
//! the input images and the network weights, and checks the parameters.
//! `Session::run` then performs the optimization and returns a
//! `GeneratedImage`.
//!
//! ## Usage
//!
//! ```no_run
//! let session = neural_style::Session::builder()
//!     .content(&"content_image/freegodness.jpeg")
//!     .style(&"style_reference/d1.jpeg")
//!     .weights(&"weights/vgg19.safetensors")
//!     .iterations(20)
//!     .build().expect("failed to build session");
//!
//! let generated = session.run(None).expect("failed to transfer style");
//! generated.save("target_image/freegodness_by_d1.png").expect("failed to save image");
//! ```
mod errors;
pub mod evaluator;
mod feature_map;
pub mod lbfgs;
pub mod loss;
mod ops;
pub mod session;
mod utils;
pub mod vgg;

pub use image;
use std::path::Path;

pub use errors::{Error, ProtocolViolation, WeightsError};
pub use evaluator::{Evaluator, ImageSlot, LossTargets, StyleObjective};
pub use feature_map::FeatureMap;
pub use session::{GeneratorProgress, ProgressStat, ProgressUpdate, Session, SessionBuilder};
pub use utils::{
    load_dynamic_image, output_file_name, postprocess, preprocess, scaled_dims, ImageSource,
    BGR_MEANS,
};
pub use vgg::{Activations, ConvWeights, Layer, Vgg19};

/// Smallest width or height that still leaves at least one pixel after the
/// four pooling stages in front of `block5`
pub const MIN_DIMENSION: u32 = 16;

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

struct Parameters {
    iterations: u32,
    max_evaluations: u32,
    target_height: u32,
    max_thread_count: Option<usize>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            iterations: 500,
            max_evaluations: 20,
            target_height: 400,
            max_thread_count: None,
        }
    }
}

impl Parameters {
    fn thread_count(&self) -> usize {
        self.max_thread_count.unwrap_or_else(num_cpus::get)
    }
}

/// An image generated by a `Session::run()`
pub struct GeneratedImage {
    image: image::RgbImage,
    loss: f64,
}

impl GeneratedImage {
    /// Saves the generated image to the specified path, creating its parent
    /// directory if needed and overwriting any existing file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        self.image.save(&path)?;
        Ok(())
    }

    /// Writes the generated image to the specified stream
    pub fn write<W: std::io::Write>(
        self,
        writer: &mut W,
        fmt: image::ImageOutputFormat,
    ) -> Result<(), Error> {
        let dyn_img = self.into_image();
        Ok(dyn_img.write_to(writer, fmt)?)
    }

    /// The value of the objective for the returned pixels
    pub fn loss(&self) -> f64 {
        self.loss
    }

    /// Returns the generated output image
    pub fn into_image(self) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(self.image)
    }
}

impl AsRef<image::RgbImage> for GeneratedImage {
    fn as_ref(&self) -> &image::RgbImage {
        &self.image
    }
}
