use crate::common::{FacegateError, Result};
use image::codecs::png::PngEncoder;
use image::{ColorType, GrayImage, ImageEncoder};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Raw enrollment frames, stored as `<data_dir>/<user>/<n>.png`.
pub struct SampleStore {
    data_dir: PathBuf,
}

impl SampleStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn user_dir(&self, user: &str) -> PathBuf {
        self.data_dir.join(user)
    }

    /// Start appending samples for `user`, creating the directory on first use.
    pub fn begin(&self, user: &str) -> Result<SampleWriter> {
        let dir = self.user_dir(user);
        fs::create_dir_all(&dir)?;
        let next_index = self
            .indexed_samples(&dir)?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(0);
        Ok(SampleWriter { dir, next_index, written: 0 })
    }

    /// Sample images for `user` in capture order.
    pub fn list(&self, user: &str) -> Result<Vec<PathBuf>> {
        let dir = self.user_dir(user);
        if !dir.is_dir() {
            return Err(FacegateError::UserNotFound(user.to_string()));
        }

        let mut numbered = self.indexed_samples(&dir)?;
        let mut named: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path) && sample_index(path).is_none())
            .collect();
        named.sort();

        numbered.sort_by_key(|(index, _)| *index);
        Ok(numbered.into_iter().map(|(_, path)| path).chain(named).collect())
    }

    fn indexed_samples(&self, dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut samples: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .filter_map(|path| sample_index(&path).map(|index| (index, path)))
            .collect();
        samples.sort_by_key(|(index, _)| *index);
        Ok(samples)
    }
}

pub struct SampleWriter {
    dir: PathBuf,
    next_index: u64,
    written: usize,
}

impl SampleWriter {
    /// Write `frame` under the next free index. Existing files are never replaced.
    pub fn append(&mut self, frame: &GrayImage) -> Result<PathBuf> {
        loop {
            let path = self.dir.join(format!("{}.png", self.next_index));
            self.next_index += 1;

            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };

            let (width, height) = frame.dimensions();
            let mut out = BufWriter::new(file);
            PngEncoder::new(&mut out).write_image(frame.as_raw(), width, height, ColorType::L8)?;
            out.flush()?;
            self.written += 1;
            return Ok(path);
        }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("png") | Some("jpg") | Some("jpeg") | Some("pgm")
    )
}

fn sample_index(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}
