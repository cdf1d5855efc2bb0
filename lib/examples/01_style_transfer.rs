use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let session = ns::Session::builder()
        // the image whose layout we want to keep
        .content(&"content_image/freegodness.jpeg")
        // the image whose brush strokes and colors we want
        .style(&"style_reference/d1.jpeg")
        .weights(&"weights/vgg19.safetensors")
        // a handful of iterations is enough to see the style come through
        .iterations(10)
        .build()?;

    let generated = session.run(Some(Box::new(|update: ns::ProgressUpdate<'_>| {
        println!(
            "iteration {}/{}: loss {:.4e}",
            update.total.current, update.total.total, update.loss
        );
    })))?;

    generated.save("target_image/freegodness_by_d1.png")
}
