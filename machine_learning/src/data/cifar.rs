use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use log::info;

use crate::{MlErr, Result};

pub const IMAGE_CHANNELS: usize = 3;
pub const IMAGE_SIDE: usize = 32;
pub const IMAGE_BYTES: usize = IMAGE_CHANNELS * IMAGE_SIDE * IMAGE_SIDE;

const RECORD_BYTES: usize = 1 + IMAGE_BYTES;
const BATCHES_DIR: &str = "cifar-10-batches-bin";
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";
const META_FILE: &str = "batches.meta.txt";

pub const CIFAR10_CLASSES: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

/// The CIFAR-10 binary distribution held in memory.
///
/// Every image is stored as `3×32×32` bytes, channel planes in RGB order,
/// each plane row-major.
#[derive(Debug, Clone)]
pub struct Cifar10 {
    images: Vec<u8>,
    labels: Vec<u8>,
    classes: Vec<String>,
}

impl Cifar10 {
    /// Reads the train or test split.
    ///
    /// # Arguments
    /// * `root` - Either the `cifar-10-batches-bin` directory or its parent.
    /// * `train` - Whether to load the five training batches or the test batch.
    ///
    /// # Returns
    /// The loaded split, an io error if a batch file is missing or a
    /// `MalformedDataset` error if its contents aren't whole records.
    pub fn load(root: &Path, train: bool) -> Result<Self> {
        let dir = batches_dir(root);
        let files: &[&str] = if train { &TRAIN_FILES } else { &[TEST_FILE] };

        let mut images = Vec::new();
        let mut labels = Vec::new();

        for file in files {
            let path = dir.join(file);
            let raw = fs::read(&path).map_err(|e| {
                io::Error::new(e.kind(), format!("reading {}: {e}", path.display()))
            })?;

            if raw.len() % RECORD_BYTES != 0 {
                return Err(MlErr::MalformedDataset(format!(
                    "{} holds {} bytes, not a multiple of the {RECORD_BYTES} byte records",
                    path.display(),
                    raw.len()
                )));
            }

            for record in raw.chunks_exact(RECORD_BYTES) {
                labels.push(record[0]);
                images.extend_from_slice(&record[1..]);
            }
        }

        let classes = read_classes(&dir)?;
        if let Some(&bad) = labels.iter().find(|&&l| l as usize >= classes.len()) {
            return Err(MlErr::MalformedDataset(format!(
                "label {bad} is out of range for {} classes",
                classes.len()
            )));
        }

        info!(train = train, samples = labels.len(); "loaded cifar10 from {}", dir.display());
        Ok(Self {
            images,
            labels,
            classes,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// The raw bytes of the image at `idx` (panics if out of bounds).
    #[inline]
    pub fn image(&self, idx: usize) -> &[u8] {
        &self.images[idx * IMAGE_BYTES..(idx + 1) * IMAGE_BYTES]
    }

    #[inline]
    pub fn label(&self, idx: usize) -> usize {
        self.labels[idx] as usize
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

fn batches_dir(root: &Path) -> PathBuf {
    let nested = root.join(BATCHES_DIR);
    if nested.is_dir() {
        nested
    } else {
        root.to_path_buf()
    }
}

fn read_classes(dir: &Path) -> Result<Vec<String>> {
    let canonical = || CIFAR10_CLASSES.iter().map(|c| c.to_string()).collect();

    match fs::read_to_string(dir.join(META_FILE)) {
        Ok(meta) => {
            let classes: Vec<String> = meta
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();

            Ok(if classes.is_empty() {
                canonical()
            } else {
                classes
            })
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(canonical()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(label: u8, fill: u8) -> Vec<u8> {
        let mut r = vec![fill; RECORD_BYTES];
        r[0] = label;
        r
    }

    #[test]
    fn reads_records_and_canonical_classes() {
        let dir = tempfile::tempdir().unwrap();
        let batches = dir.path().join(BATCHES_DIR);
        fs::create_dir(&batches).unwrap();

        let raw = [record(3, 7), record(9, 200)].concat();
        fs::write(batches.join(TEST_FILE), raw).unwrap();

        let test = Cifar10::load(dir.path(), false).unwrap();
        assert_eq!(test.len(), 2);
        assert_eq!(test.label(1), 9);
        assert!(test.image(1).iter().all(|&p| p == 200));
        assert_eq!(test.classes()[3], "cat");
    }

    #[test]
    fn missing_and_truncated_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Cifar10::load(dir.path(), true),
            Err(MlErr::Io(_))
        ));

        fs::write(dir.path().join(TEST_FILE), vec![0; RECORD_BYTES + 5]).unwrap();
        assert!(matches!(
            Cifar10::load(dir.path(), false),
            Err(MlErr::MalformedDataset(_))
        ));
    }

    #[test]
    fn class_names_come_from_the_meta_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(TEST_FILE), record(1, 0)).unwrap();
        fs::write(dir.path().join(META_FILE), "a\nb\n\n").unwrap();

        let test = Cifar10::load(dir.path(), false).unwrap();
        assert_eq!(test.classes(), ["a", "b"]);
    }
}
