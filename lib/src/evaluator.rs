use crate::{
    errors::{Error, ProtocolViolation},
    lbfgs::Objective,
    loss::{self, Gram},
    vgg::Vgg19,
    Dims, FeatureMap,
};

/// Position of each image in the stacked network input
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageSlot {
    Content = 0,
    Style = 1,
    Combination = 2,
}

/// The activations of the content and style slots that the combination is
/// compared against. Neither image changes during a run, so their rows of the
/// stack are evaluated once, up front.
pub struct LossTargets {
    content: FeatureMap,
    style: Vec<Gram>,
}

impl LossTargets {
    /// Runs the content and style images, stacked in slot order, through the
    /// network and keeps what the loss terms read
    pub fn new(network: &Vgg19, content: &[f64], style: &[f64], dims: Dims, threads: usize) -> Self {
        let (h, w) = (dims.height as usize, dims.width as usize);
        let stack = [
            FeatureMap::from_f64(h, w, 3, content),
            FeatureMap::from_f64(h, w, 3, style),
        ];

        let content = network
            .forward(&stack[ImageSlot::Content as usize], loss::CONTENT_LAYER, threads)
            .get(loss::CONTENT_LAYER)
            .clone();

        let deepest_style = loss::STYLE_LAYERS[loss::STYLE_LAYERS.len() - 1];
        let acts = network.forward(&stack[ImageSlot::Style as usize], deepest_style, threads);
        let style = loss::STYLE_LAYERS
            .iter()
            .map(|layer| Gram::new(acts.get(*layer)))
            .collect();

        Self { content, style }
    }
}

/// Computes the total loss and its gradient for a combination image
pub struct StyleObjective<'n> {
    network: &'n Vgg19,
    targets: LossTargets,
    dims: Dims,
    threads: usize,
}

impl<'n> StyleObjective<'n> {
    pub fn new(network: &'n Vgg19, targets: LossTargets, dims: Dims, threads: usize) -> Self {
        Self {
            network,
            targets,
            dims,
            threads,
        }
    }

    /// Length of the flattened combination image
    #[inline]
    pub fn len(&self) -> usize {
        self.dims.width as usize * self.dims.height as usize * 3
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn loss_and_grads(&self, x: &[f64]) -> Result<(f64, Vec<f64>), Error> {
        if x.len() != self.len() {
            return Err(Error::DimensionMismatch {
                expected: self.len(),
                actual: x.len(),
            });
        }

        let (h, w) = (self.dims.height as usize, self.dims.width as usize);
        let image = FeatureMap::from_f64(h, w, 3, x);
        let acts = self
            .network
            .forward(&image, loss::deepest_layer(), self.threads);

        let mut total = 0.0;
        let mut injected = Vec::with_capacity(loss::STYLE_LAYERS.len() + 1);

        let combination = acts.get(loss::CONTENT_LAYER);
        total += loss::CONTENT_WEIGHT * loss::content_loss(&self.targets.content, combination);
        injected.push((
            loss::CONTENT_LAYER,
            loss::content_grad(
                &self.targets.content,
                combination,
                loss::CONTENT_WEIGHT as f32,
            ),
        ));

        let norm = loss::style_norm(3, h * w);
        let per_layer = loss::STYLE_WEIGHT / loss::STYLE_LAYERS.len() as f64;
        for (layer, style) in loss::STYLE_LAYERS.iter().zip(self.targets.style.iter()) {
            let features = acts.get(*layer);
            let gram = Gram::new(features);

            total += per_layer * loss::style_loss(style, &gram, norm);
            injected.push((
                *layer,
                loss::style_grad(style, &gram, features, norm, per_layer),
            ));
        }

        let image_grad = self
            .network
            .backward(&image, &acts, injected, self.threads);
        let mut grads: Vec<f64> = image_grad
            .as_slice()
            .iter()
            .map(|g| f64::from(*g))
            .collect();

        total += loss::TOTAL_VARIATION_WEIGHT * loss::total_variation_loss(x, h, w, 3);
        loss::add_total_variation_grad(x, h, w, 3, loss::TOTAL_VARIATION_WEIGHT, &mut grads);

        Ok((total, grads))
    }
}

enum State {
    AwaitingLoss,
    AwaitingGrads { grads: Vec<f64> },
}

/// Adapts `StyleObjective` to the solver's separate loss and gradient
/// callbacks. A single evaluation computes both, the gradient is parked until
/// it is asked for.
pub struct Evaluator<'n> {
    objective: StyleObjective<'n>,
    state: State,
}

impl<'n> Evaluator<'n> {
    pub fn new(objective: StyleObjective<'n>) -> Self {
        Self {
            objective,
            state: State::AwaitingLoss,
        }
    }

    /// Evaluates the loss at `x`, caching the gradient for the following
    /// `grads` call
    pub fn loss(&mut self, x: &[f64]) -> Result<f64, Error> {
        if let State::AwaitingGrads { .. } = self.state {
            return Err(ProtocolViolation::LossTwice.into());
        }

        let (loss, grads) = self.objective.loss_and_grads(x)?;
        self.state = State::AwaitingGrads { grads };
        Ok(loss)
    }

    /// Hands out the gradient cached by the preceding `loss` call
    pub fn grads(&mut self, _x: &[f64]) -> Result<Vec<f64>, Error> {
        match std::mem::replace(&mut self.state, State::AwaitingLoss) {
            State::AwaitingGrads { grads } => Ok(grads),
            State::AwaitingLoss => Err(ProtocolViolation::GradsBeforeLoss.into()),
        }
    }

    #[inline]
    pub fn is_awaiting_grads(&self) -> bool {
        matches!(self.state, State::AwaitingGrads { .. })
    }
}

impl<'n> Objective for Evaluator<'n> {
    fn loss(&mut self, x: &[f64]) -> Result<f64, Error> {
        Evaluator::loss(self, x)
    }

    fn grads(&mut self, x: &[f64]) -> Result<Vec<f64>, Error> {
        Evaluator::grads(self, x)
    }
}
