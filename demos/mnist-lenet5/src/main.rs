use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use lenet5::{
    dataset::{
        mnist::{Mnist, MnistKind},
        Normalization, PrepareOptions,
    },
    learn::{
        analysis::{most_confident_errors, ConfusionMatrix, Misclassification},
        neural_network::{
            layer::Layer,
            lenet5::LeNet5,
            trainer::{LearningRate, TrainConfig, Trainer},
        },
        EpochStats, Summary,
    },
};
use serde::Serialize;
use std::{fs, fs::File, io::BufWriter, path::PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about = "Trains LeNet-5 on MNIST.", long_about = None)]
struct Options {
    /// Directory of the MNIST files, defaults to the downloads directory.
    #[arg(long)]
    data: Option<PathBuf>,
    /// Download missing files.
    #[arg(long)]
    download: bool,
    /// Use Fashion MNIST.
    #[arg(long)]
    fashion: bool,
    /// Json training config, overridden by the flags below.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Constant learning rate.
    #[arg(long, conflicts_with = "paper_schedule")]
    learning_rate: Option<f32>,
    /// Use the learning rate schedule of the paper.
    #[arg(long)]
    paper_schedule: bool,
    #[arg(long)]
    momentum: Option<f32>,
    /// Seed for initialization and shuffling.
    #[arg(long)]
    seed: Option<u64>,
    /// Connect every S2 map to every C3 map.
    #[arg(long)]
    full_c3: bool,
    /// Learn the output prototypes.
    #[arg(long)]
    trainable_prototypes: bool,
    /// Save the trained model to this path.
    #[arg(long)]
    save: Option<PathBuf>,
    /// Directory for the history, confusion matrix and plots.
    #[arg(long, default_value = "lenet5-output")]
    output: PathBuf,
    /// The number of misclassifications to report.
    #[arg(long, default_value_t = 10)]
    errors: usize,
}

impl Options {
    fn train_config(&self) -> Result<TrainConfig> {
        let mut config = if let Some(path) = self.config.as_ref() {
            TrainConfig::from_path(path)?
        } else {
            TrainConfig::default()
        };
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = LearningRate::Constant(learning_rate);
        }
        if self.paper_schedule {
            config.learning_rate = LearningRate::Paper;
        }
        if let Some(momentum) = self.momentum {
            config.momentum = momentum;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Serialize)]
struct Report<'a> {
    config: &'a TrainConfig,
    normalization: Normalization,
    summary: &'a Summary,
    history: &'a [EpochStats],
    confusion: &'a ConfusionMatrix,
    errors: &'a [Misclassification],
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let options = Options::parse();
    let config = options.train_config()?;
    tracing::info!("{:#?}", config);

    let kind = if options.fashion {
        MnistKind::Fashion
    } else {
        MnistKind::Digits
    };
    let mut builder = Mnist::builder().kind(kind).download(options.download);
    if let Some(path) = options.data.as_deref() {
        builder = builder.path(path);
    }
    let mnist = builder.build()?;
    let (train_images, train_classes) = mnist.train();
    let (test_images, test_classes) = mnist.test();
    let normalization = Normalization::from_images(train_images)?;
    tracing::info!(
        "normalization mean: {} std: {}",
        normalization.mean(),
        normalization.std()
    );
    let prepare = PrepareOptions::default();
    let train = prepare.prepare(train_images, train_classes, &normalization)?;
    let test = prepare.prepare(test_images, test_classes, &normalization)?;
    tracing::info!("train: {} test: {}", train.len(), test.len());

    let model = LeNet5::builder()
        .seed(config.seed)
        .connection_table(!options.full_c3)
        .trainable_prototypes(options.trainable_prototypes)
        .build()?;
    tracing::info!("parameters: {}", model.parameter_count());

    let test_batch_size = config.test_batch_size;
    let mut trainer = Trainer::new(model, config)?;
    let bar = ProgressBar::new(trainer.config().epochs as u64).with_style(
        ProgressStyle::with_template("[{elapsed_precise}] [{bar:40}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    let summary = trainer.fit(&train, &test, |_, stats| {
        bar.inc(1);
        bar.set_message(format!(
            "train_loss: {:.5} test_accuracy: {:.2}%",
            stats.train.mean_loss().unwrap_or(f32::NAN),
            100. * stats.test.and_then(|x| x.accuracy()).unwrap_or(f32::NAN),
        ));
        Ok(())
    })?;
    bar.finish();
    println!("{summary:#?}");

    let model = trainer.model();
    let confusion = ConfusionMatrix::evaluate(model, &test, test_batch_size)?;
    println!("{confusion}");
    let errors = most_confident_errors(model, &test, test_batch_size, options.errors)?;
    for error in errors.iter() {
        println!(
            "#{} class: {} predicted: {} confidence: {:.3}",
            error.index, error.class, error.predicted, error.confidence
        );
    }

    if let Some(path) = options.save.as_ref() {
        model.save(path)?;
        tracing::info!("saved model to {:?}", path);
    }
    fs::create_dir_all(&options.output)?;
    let report = Report {
        config: trainer.config(),
        normalization,
        summary: &summary,
        history: trainer.history(),
        confusion: &confusion,
        errors: &errors,
    };
    let report_path = options.output.join("report.json");
    serde_json::to_writer_pretty(BufWriter::new(File::create(&report_path)?), &report)?;
    tracing::info!("saved report to {:?}", report_path);

    if !cfg!(feature = "plotters") {
        println!("Feature plotters not enabled, plots not generated. Try running with:\n\tcargo run --features plotters");
    }
    #[cfg(feature = "plotters")]
    {
        plot::curves(&options.output.join("curves.png"), trainer.history())?;
        plot::confusion(&options.output.join("confusion.png"), &confusion)?;
    }
    Ok(())
}

#[cfg(feature = "plotters")]
mod plot {
    use super::*;
    use lenet5::dataset::CLASSES;
    use plotters::prelude::*;
    use std::path::Path;

    /// Loss and accuracy per epoch.
    pub(super) fn curves(path: &Path, history: &[EpochStats]) -> Result<()> {
        let epochs = history.len().max(1) as f32;
        let root = BitMapBackend::new(path, (1200, 500)).into_drawing_area();
        root.fill(&WHITE)?;
        let (left, right) = root.split_horizontally(600);
        let loss = |f: fn(&EpochStats) -> Option<f32>| -> Vec<(f32, f32)> {
            history
                .iter()
                .filter_map(|stats| Some((stats.epoch as f32, f(stats)?)))
                .collect()
        };
        let train_loss = loss(|x| x.train.mean_loss());
        let test_loss = loss(|x| x.test?.mean_loss());
        let max_loss = train_loss
            .iter()
            .chain(test_loss.iter())
            .map(|(_, y)| *y)
            .filter(|y| y.is_finite())
            .fold(1f32, f32::max);
        let mut chart = ChartBuilder::on(&left)
            .caption("Loss", ("sans-serif", 30).into_font())
            .margin(20)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(0f32..epochs, 0f32..max_loss)?;
        chart.configure_mesh().x_desc("epoch").draw()?;
        chart
            .draw_series(LineSeries::new(train_loss, &RED))?
            .label("train")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));
        chart
            .draw_series(LineSeries::new(test_loss, &BLUE))?
            .label("test")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));
        chart.configure_series_labels().border_style(BLACK).draw()?;

        let mut chart = ChartBuilder::on(&right)
            .caption("Accuracy", ("sans-serif", 30).into_font())
            .margin(20)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(0f32..epochs, 0f32..1f32)?;
        chart.configure_mesh().x_desc("epoch").draw()?;
        chart
            .draw_series(LineSeries::new(loss(|x| x.train.accuracy()), &RED))?
            .label("train")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));
        chart
            .draw_series(LineSeries::new(loss(|x| x.test?.accuracy()), &BLUE))?
            .label("test")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));
        chart.configure_series_labels().border_style(BLACK).draw()?;
        root.present()?;
        tracing::info!("plot saved to {:?}", path);
        Ok(())
    }

    /// Heatmap of the confusion matrix, normalized per class.
    pub(super) fn confusion(path: &Path, confusion: &ConfusionMatrix) -> Result<()> {
        let root = BitMapBackend::new(path, (700, 700)).into_drawing_area();
        root.fill(&WHITE)?;
        let classes = CLASSES as i32;
        let mut chart = ChartBuilder::on(&root)
            .caption("Confusion (class x predicted)", ("sans-serif", 30).into_font())
            .margin(20)
            .x_label_area_size(30)
            .y_label_area_size(30)
            .build_cartesian_2d(0..classes, 0..classes)?;
        chart
            .configure_mesh()
            .disable_mesh()
            .x_desc("predicted")
            .y_desc("class")
            .draw()?;
        let rows = confusion.row_sums();
        let counts = confusion.counts();
        chart.draw_series(counts.indexed_iter().map(|((class, predicted), count)| {
            let fraction = *count as f64 / rows[class].max(1) as f64;
            let (x, y) = (predicted as i32, class as i32);
            Rectangle::new([(x, y), (x + 1, y + 1)], BLUE.mix(fraction).filled())
        }))?;
        root.present()?;
        tracing::info!("plot saved to {:?}", path);
        Ok(())
    }
}
