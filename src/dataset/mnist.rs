use crate::{error::Error, result::Result};
use anyhow::{ensure, Context};
use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use ndarray::{s, ArcArray, ArcArray1, ArrayView1, ArrayView4, Ix4};
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

/// The kind of Mnist.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MnistKind {
    /// [MNIST](<http://yann.lecun.com/exdb/mnist/>)
    Digits,
    /// [FashionMNIST](<https://github.com/zalandoresearch/fashion-mnist>)
    Fashion,
}

impl MnistKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Digits => "mnist",
            Self::Fashion => "fashion-mnist",
        }
    }
    #[cfg_attr(not(feature = "download"), allow(unused))]
    fn url(&self, file_name: &str) -> String {
        match self {
            Self::Digits => format!("https://ossci-datasets.s3.amazonaws.com/mnist/{file_name}"),
            Self::Fashion => format!(
                "http://fashion-mnist.s3-website.eu-central-1.amazonaws.com/{file_name}"
            ),
        }
    }
}

/// Mnist builder.
pub mod builders {
    use super::{Mnist, MnistKind, Result};
    use std::path::Path;

    /// Mnist builder.
    #[derive(Debug)]
    pub struct MnistBuilder<'a> {
        pub(super) path: Option<&'a Path>,
        pub(super) kind: MnistKind,
        pub(super) download: bool,
    }

    impl Default for MnistBuilder<'_> {
        fn default() -> Self {
            Self {
                path: None,
                kind: MnistKind::Digits,
                download: false,
            }
        }
    }

    impl MnistBuilder<'_> {
        /// The path to load the dataset from.
        ///
        /// This is the folder the files will be downloaded to / loaded from. If not specified, uses the OS specific "Downloads" directory or the "Temp" directory, joined with "mnist" or "fashion-mnist".
        pub fn path(self, path: &Path) -> MnistBuilder {
            MnistBuilder {
                path: Some(path),
                kind: self.kind,
                download: self.download,
            }
        }
        /// The kind of Mnist to use. Defaults to [`MnistKind::Digits`] (ie the original MNIST dataset).
        pub fn kind(self, kind: MnistKind) -> Self {
            Self { kind, ..self }
        }
        /// Whether to download missing files. Defaults to false.
        ///
        /// Requires feature "download".
        pub fn download(self, download: bool) -> Self {
            Self { download, ..self }
        }
        /// Builds the dataset.
        ///
        /// **Errors**
        /// - The download failed.
        /// - The files were not found.
        /// - Decompressing / loading the data failed.
        /// - The images are not 28 x 28 ([`Error::ShapeMismatch`](crate::error::Error::ShapeMismatch)).
        pub fn build(&self) -> Result<Mnist> {
            Mnist::build(self)
        }
    }
}
use builders::MnistBuilder;

const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";
const NAMES: [&str; 4] = [TRAIN_IMAGES, TRAIN_LABELS, TEST_IMAGES, TEST_LABELS];

const IMAGES_MAGIC: i32 = 2_051;
const LABELS_MAGIC: i32 = 2_049;
/// The native resolution of Mnist images.
pub const IMAGE_SIZE: usize = 28;

/// The MNIST dataset.
///
/// Stores the training images followed by the test images.
#[derive(Clone, Debug)]
pub struct Mnist {
    kind: MnistKind,
    images: ArcArray<u8, Ix4>,
    classes: ArcArray1<u8>,
    train_len: usize,
}

impl Mnist {
    /// Returns an [`MnistBuilder`] used to specify options.
    ///
    /// ```no_run
    /// # use lenet5::{
    /// #    result::Result,
    /// #    dataset::mnist::{Mnist, MnistKind},
    /// # };
    /// # fn main() -> Result<()> {
    /// let mnist = Mnist::builder()
    ///     .kind(MnistKind::Fashion)
    ///     .download(true)
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> MnistBuilder<'static> {
        MnistBuilder::default()
    }
    fn build(builder: &MnistBuilder) -> Result<Self> {
        let mnist_path = builder
            .path
            .map(Path::to_owned)
            .unwrap_or_else(|| {
                dirs::download_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join(builder.kind.name())
            });
        if builder.download {
            download(builder.kind, &mnist_path)?;
        }
        let gz_path = |name: &str| -> PathBuf { mnist_path.join(name).with_extension("gz") };
        let (mut images, train_len) = read_images(&gz_path(TRAIN_IMAGES))?;
        let (mut classes, train_labels) = read_labels(&gz_path(TRAIN_LABELS))?;
        ensure!(
            train_len == train_labels,
            Error::ShapeMismatch {
                expected: vec![train_len],
                found: vec![train_labels],
            }
        );
        let (test_images, test_len) = read_images(&gz_path(TEST_IMAGES))?;
        let (test_classes, test_labels) = read_labels(&gz_path(TEST_LABELS))?;
        ensure!(
            test_len == test_labels,
            Error::ShapeMismatch {
                expected: vec![test_len],
                found: vec![test_labels],
            }
        );
        images.extend(test_images);
        classes.extend(test_classes);
        let len = train_len + test_len;
        let images = ArcArray::from_shape_vec([len, 1, IMAGE_SIZE, IMAGE_SIZE], images)?;
        let classes = ArcArray::from_shape_vec([len], classes)?;
        tracing::info!(
            kind = ?builder.kind,
            train = train_len,
            test = test_len,
            path = ?mnist_path,
            "loaded mnist"
        );
        Ok(Self {
            kind: builder.kind,
            images,
            classes,
            train_len,
        })
    }
    /// The kind.
    pub fn kind(&self) -> MnistKind {
        self.kind
    }
    /// The images.
    ///
    /// Shape = \[N, 1, 28, 28\], typically N = 70_000.
    pub fn images(&self) -> &ArcArray<u8, Ix4> {
        &self.images
    }
    /// The classes.
    ///
    /// Shape = \[N\].
    ///
    /// The classes range from 0 to 9 inclusive.
    pub fn classes(&self) -> &ArcArray1<u8> {
        &self.classes
    }
    /// The training images and classes, typically 60_000.
    pub fn train(&self) -> (ArrayView4<u8>, ArrayView1<u8>) {
        let n = self.train_len;
        (
            self.images.slice(s![..n, .., .., ..]),
            self.classes.slice(s![..n]),
        )
    }
    /// The test images and classes, typically 10_000.
    pub fn test(&self) -> (ArrayView4<u8>, ArrayView1<u8>) {
        let n = self.train_len;
        (
            self.images.slice(s![n.., .., .., ..]),
            self.classes.slice(s![n..]),
        )
    }
}

fn open(path: &Path) -> Result<GzDecoder<File>> {
    let file = File::open(path).with_context(|| format!("Failed to open {path:?}!"))?;
    Ok(GzDecoder::new(file))
}

fn read_images(path: &Path) -> Result<(Vec<u8>, usize)> {
    let mut decoder = open(path)?;
    let magic = decoder.read_i32::<BigEndian>()?;
    ensure!(
        magic == IMAGES_MAGIC,
        "Expected magic {IMAGES_MAGIC} in {path:?}, found {magic}!"
    );
    let n = usize::try_from(decoder.read_i32::<BigEndian>()?)?;
    let rows = usize::try_from(decoder.read_i32::<BigEndian>()?)?;
    let cols = usize::try_from(decoder.read_i32::<BigEndian>()?)?;
    ensure!(
        rows == IMAGE_SIZE && cols == IMAGE_SIZE,
        Error::ShapeMismatch {
            expected: vec![IMAGE_SIZE, IMAGE_SIZE],
            found: vec![rows, cols],
        }
    );
    let mut data = Vec::with_capacity(n * rows * cols);
    decoder.read_to_end(&mut data)?;
    ensure!(
        data.len() == n * rows * cols,
        "Expected {} bytes in {path:?}, found {}!",
        n * rows * cols,
        data.len()
    );
    Ok((data, n))
}

fn read_labels(path: &Path) -> Result<(Vec<u8>, usize)> {
    let mut decoder = open(path)?;
    let magic = decoder.read_i32::<BigEndian>()?;
    ensure!(
        magic == LABELS_MAGIC,
        "Expected magic {LABELS_MAGIC} in {path:?}, found {magic}!"
    );
    let n = usize::try_from(decoder.read_i32::<BigEndian>()?)?;
    let mut data = Vec::with_capacity(n);
    decoder.read_to_end(&mut data)?;
    ensure!(
        data.len() == n,
        "Expected {n} labels in {path:?}, found {}!",
        data.len()
    );
    if let Some(class) = data.iter().copied().find(|x| *x >= 10) {
        return Err(Error::InvalidLabel(class).into());
    }
    Ok((data, n))
}

#[cfg(feature = "download")]
fn download(kind: MnistKind, mnist_path: &Path) -> Result<()> {
    use curl::easy::Easy;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::{fs, io::Write};

    fs::create_dir_all(mnist_path)?;
    let style = ProgressStyle::with_template(
        "{msg:>24} [{bar:40}] {bytes:>10}/{total_bytes:10} [eta: {eta}]",
    )?
    .progress_chars("=> ");
    for name in NAMES {
        let path = mnist_path.join(name).with_extension("gz");
        if path.exists() {
            continue;
        }
        let url = kind.url(&format!("{name}.gz"));
        tracing::info!(%url, ?path, "downloading");
        let bar = ProgressBar::new(0).with_style(style.clone());
        bar.set_message(name);
        let part_path = path.with_extension("gz.part");
        let mut file = File::create(&part_path)?;
        let mut easy = Easy::new();
        easy.url(&url)?;
        easy.follow_location(true)?;
        easy.fail_on_error(true)?;
        easy.progress(true)?;
        {
            let mut transfer = easy.transfer();
            transfer.write_function(|data| {
                Ok(if file.write_all(data).is_ok() {
                    data.len()
                } else {
                    0
                })
            })?;
            transfer.progress_function(|total, done, _, _| {
                bar.set_length(total as u64);
                bar.set_position(done as u64);
                true
            })?;
            transfer
                .perform()
                .with_context(|| format!("Failed to download {url}!"))?;
        }
        file.flush()?;
        bar.finish();
        fs::rename(&part_path, &path)?;
    }
    Ok(())
}

#[cfg(not(feature = "download"))]
fn download(_kind: MnistKind, mnist_path: &Path) -> Result<()> {
    let missing: Vec<_> = NAMES
        .iter()
        .filter(|name| !mnist_path.join(name).with_extension("gz").exists())
        .collect();
    ensure!(
        missing.is_empty(),
        "Missing {missing:?} in {mnist_path:?}, downloading requires feature \"download\"!"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn write_gz(path: &Path, header: &[i32], data: &[u8]) -> Result<()> {
        let mut encoder = GzEncoder::new(File::create(path)?, Compression::default());
        for x in header {
            encoder.write_all(&x.to_be_bytes())?;
        }
        encoder.write_all(data)?;
        encoder.finish()?;
        Ok(())
    }

    fn write_mnist(dir: &Path, train: usize, test: usize, size: i32) -> Result<()> {
        let pixels = (size * size) as usize;
        for (name, n) in [(TRAIN_IMAGES, train), (TEST_IMAGES, test)] {
            let data: Vec<u8> = (0..n * pixels).map(|i| (i % 256) as u8).collect();
            write_gz(
                &dir.join(name).with_extension("gz"),
                &[IMAGES_MAGIC, n as i32, size, size],
                &data,
            )?;
        }
        for (name, n) in [(TRAIN_LABELS, train), (TEST_LABELS, test)] {
            let data: Vec<u8> = (0..n).map(|i| (i % 10) as u8).collect();
            write_gz(
                &dir.join(name).with_extension("gz"),
                &[LABELS_MAGIC, n as i32],
                &data,
            )?;
        }
        Ok(())
    }

    #[test]
    fn mnist_from_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_mnist(dir.path(), 6, 4, 28)?;
        let mnist = Mnist::builder().path(dir.path()).build()?;
        assert_eq!(mnist.kind(), MnistKind::Digits);
        assert_eq!(mnist.images().shape(), &[10, 1, 28, 28]);
        let (train_images, train_classes) = mnist.train();
        let (test_images, test_classes) = mnist.test();
        assert_eq!(train_images.shape(), &[6, 1, 28, 28]);
        assert_eq!(train_classes.to_vec(), [0, 1, 2, 3, 4, 5]);
        assert_eq!(test_images.shape(), &[4, 1, 28, 28]);
        assert_eq!(test_classes.to_vec(), [0, 1, 2, 3]);
        assert_eq!(test_images[(0, 0, 0, 1)], 1);
        Ok(())
    }

    #[test]
    fn mnist_rejects_resolution() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_mnist(dir.path(), 2, 2, 27)?;
        let error = Mnist::builder().path(dir.path()).build().unwrap_err();
        assert_eq!(
            error.downcast_ref::<Error>(),
            Some(&Error::ShapeMismatch {
                expected: vec![28, 28],
                found: vec![27, 27],
            })
        );
        Ok(())
    }

    #[test]
    fn mnist_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Mnist::builder().path(dir.path()).build().is_err());
    }
}
