//! Seed sources: local byte streams consulted for reusable blocks

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::error::{Error, Result};

/// A local file offered as a source of reusable blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub path: PathBuf,
}

impl Seed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open the seed as a plain byte stream; `.gz` seeds are decompressed
    /// transparently so the scanner only ever sees target-shaped bytes
    pub fn open(&self) -> Result<Box<dyn Read>> {
        let file = File::open(&self.path)
            .map_err(|e| Error::io(format!("opening seed {}", self.path.display()), e))?;
        let reader = BufReader::new(file);

        if self.path.extension().map(|e| e == "gz").unwrap_or(false) {
            Ok(Box::new(GzDecoder::new(reader)))
        } else {
            Ok(Box::new(reader))
        }
    }
}

/// Ordered seed collection; insertion order is scan order and duplicates
/// are dropped (the first mention wins)
#[derive(Debug, Default)]
pub struct SeedList {
    seeds: Vec<Seed>,
}

impl SeedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl AsRef<Path>) {
        let seed = Seed::new(path.as_ref());
        if !self.seeds.contains(&seed) {
            self.seeds.push(seed);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Seed> {
        self.seeds.iter()
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}
