use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use log::{debug, warn};
use walkdir::WalkDir;

/// Digits in every frame file name; wide enough that lexical and numeric order agree
pub const FRAME_INDEX_WIDTH: usize = 6;

/// Index of the first frame written by the extractor
pub const FIRST_FRAME_INDEX: u32 = 1;

const RAW_FRAME_PREFIX: &str = "file";
const PROCESSED_EXTENSION: &str = "png";

/// Audio artifact name inside the audio staging area
pub const AUDIO_FILE_NAME: &str = "audio.m4a";

/// One of the four on-disk staging areas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheArea {
    FramesJpeg,
    FramesPng,
    Audio,
    Processed,
}

impl CacheArea {
    pub const ALL: [CacheArea; 4] = [
        CacheArea::FramesJpeg,
        CacheArea::FramesPng,
        CacheArea::Audio,
        CacheArea::Processed,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheArea::FramesJpeg => "img_cache_jpg",
            CacheArea::FramesPng => "img_cache_png",
            CacheArea::Audio => "audio_cache",
            CacheArea::Processed => "img_process_cache",
        }
    }
}

/// Raw frame cache format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Jpeg,
    Png,
}

impl FrameFormat {
    /// Quality mode keeps lossless PNG frames
    pub fn from_quality(quality: bool) -> Self {
        if quality {
            FrameFormat::Png
        } else {
            FrameFormat::Jpeg
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "jpg",
            FrameFormat::Png => "png",
        }
    }

    pub fn area(&self) -> CacheArea {
        match self {
            FrameFormat::Jpeg => CacheArea::FramesJpeg,
            FrameFormat::Png => CacheArea::FramesPng,
        }
    }
}

/// `file000042.jpg`
pub fn raw_frame_name(index: u32, format: FrameFormat) -> String {
    format!("{}{:0width$}.{}", RAW_FRAME_PREFIX, index, format.extension(), width = FRAME_INDEX_WIDTH)
}

/// `000042.png`
pub fn processed_frame_name(index: u32) -> String {
    format!("{:0width$}.{}", index, PROCESSED_EXTENSION, width = FRAME_INDEX_WIDTH)
}

/// printf-style pattern handed to the extractor
pub fn raw_frame_pattern(format: FrameFormat) -> String {
    format!("{}%0{}d.{}", RAW_FRAME_PREFIX, FRAME_INDEX_WIDTH, format.extension())
}

/// printf-style pattern handed to the re-encoder
pub fn processed_frame_pattern() -> String {
    format!("%0{}d.{}", FRAME_INDEX_WIDTH, PROCESSED_EXTENSION)
}

pub fn parse_raw_frame_index(name: &str, format: FrameFormat) -> Option<u32> {
    let digits = name
        .strip_prefix(RAW_FRAME_PREFIX)?
        .strip_suffix(format.extension())?
        .strip_suffix('.')?;
    parse_index_digits(digits)
}

pub fn parse_processed_index(name: &str) -> Option<u32> {
    let digits = name.strip_suffix(PROCESSED_EXTENSION)?.strip_suffix('.')?;
    parse_index_digits(digits)
}

fn parse_index_digits(digits: &str) -> Option<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The four staging directories of one pipeline context.
///
/// Listings are snapshots: callers re-query to see new arrivals. There is no
/// locking; every frame index is written by one producer and read by one consumer.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, area: CacheArea) -> PathBuf {
        self.root.join(area.dir_name())
    }

    pub fn frames_dir(&self, format: FrameFormat) -> PathBuf {
        self.dir(format.area())
    }

    /// Create any staging directory that does not exist yet
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for area in CacheArea::ALL {
            fs::create_dir_all(self.dir(area))?;
        }
        Ok(())
    }

    /// Current file names in a staging area, sorted
    pub fn list(&self, area: CacheArea) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(self.dir(area))
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) => names.push(name.to_string()),
                None => warn!("Ignoring non UTF-8 cache entry: {}", entry.path().display()),
            }
        }
        Ok(names)
    }

    /// Indices of the complete raw frames of the given format
    pub fn frame_indices(&self, format: FrameFormat) -> io::Result<BTreeSet<u32>> {
        Ok(self
            .list(format.area())?
            .iter()
            .filter_map(|name| parse_raw_frame_index(name, format))
            .collect())
    }

    pub fn processed_indices(&self) -> io::Result<BTreeSet<u32>> {
        Ok(self
            .list(CacheArea::Processed)?
            .iter()
            .filter_map(|name| parse_processed_index(name))
            .collect())
    }

    pub fn raw_frame_path(&self, index: u32, format: FrameFormat) -> PathBuf {
        self.frames_dir(format).join(raw_frame_name(index, format))
    }

    pub fn processed_frame_path(&self, index: u32) -> PathBuf {
        self.dir(CacheArea::Processed).join(processed_frame_name(index))
    }

    /// First file in the audio area, if the source had any audio
    pub fn audio_artifact(&self) -> io::Result<Option<PathBuf>> {
        Ok(self
            .list(CacheArea::Audio)?
            .into_iter()
            .next()
            .map(|name| self.dir(CacheArea::Audio).join(name)))
    }

    /// Remove every file in one staging area. A missing directory counts as empty.
    pub fn clear(&self, area: CacheArea) -> io::Result<usize> {
        let dir = self.dir(area);
        if !dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for name in self.list(area)? {
            match fs::remove_file(dir.join(&name)) {
                Ok(()) => removed += 1,
                // a concurrent writer may rename or remove the file under us
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Remove every file from all four staging areas
    pub fn clear_all(&self) -> io::Result<usize> {
        let mut removed = 0;
        for area in CacheArea::ALL {
            removed += self.clear(area)?;
        }
        debug!("Cleared {} cached file(s) under {}", removed, self.root.display());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache"));
        store.ensure_dirs().unwrap();
        (dir, store)
    }

    #[test]
    fn test_clear_all_empties_every_area_and_is_idempotent() {
        let (_tmp, store) = store();
        for area in CacheArea::ALL {
            fs::write(store.dir(area).join("a.bin"), b"x").unwrap();
            fs::write(store.dir(area).join("b.bin"), b"y").unwrap();
        }

        assert_eq!(store.clear_all().unwrap(), 8);
        for area in CacheArea::ALL {
            assert!(store.list(area).unwrap().is_empty(), "{:?} not empty", area);
        }
        assert_eq!(store.clear_all().unwrap(), 0);
    }

    #[test]
    fn test_clear_tolerates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("never-created"));
        assert_eq!(store.clear_all().unwrap(), 0);
    }

    #[test]
    fn test_listing_is_a_snapshot() {
        let (_tmp, store) = store();
        fs::write(store.raw_frame_path(1, FrameFormat::Jpeg), b"1").unwrap();
        let before = store.list(CacheArea::FramesJpeg).unwrap();
        fs::write(store.raw_frame_path(2, FrameFormat::Jpeg), b"2").unwrap();

        assert_eq!(before, vec!["file000001.jpg".to_string()]);
        assert_eq!(store.list(CacheArea::FramesJpeg).unwrap().len(), 2);
    }

    #[test]
    fn test_frame_indices_ignore_foreign_and_partial_files() {
        let (_tmp, store) = store();
        let jpg_dir = store.frames_dir(FrameFormat::Jpeg);
        fs::write(jpg_dir.join("file000001.jpg"), b"1").unwrap();
        fs::write(jpg_dir.join("file000002.jpg"), b"2").unwrap();
        // in-flight atomic write and a stray png
        fs::write(jpg_dir.join("file000003.jpg.tmp"), b"3").unwrap();
        fs::write(jpg_dir.join("file000004.png"), b"4").unwrap();

        let indices: Vec<u32> = store.frame_indices(FrameFormat::Jpeg).unwrap().into_iter().collect();
        assert_eq!(indices, vec![1, 2]);
        assert!(store.frame_indices(FrameFormat::Png).unwrap().is_empty());
    }

    #[test]
    fn test_quality_selects_distinct_frame_directories() {
        let (_tmp, store) = store();
        assert_eq!(FrameFormat::from_quality(true), FrameFormat::Png);
        assert_eq!(FrameFormat::from_quality(false), FrameFormat::Jpeg);
        assert_ne!(store.frames_dir(FrameFormat::Png), store.frames_dir(FrameFormat::Jpeg));
        assert!(store.frames_dir(FrameFormat::Png).ends_with("img_cache_png"));
    }

    #[test]
    fn test_audio_artifact_presence() {
        let (_tmp, store) = store();
        assert_eq!(store.audio_artifact().unwrap(), None);
        fs::write(store.dir(CacheArea::Audio).join(AUDIO_FILE_NAME), b"aac").unwrap();
        let audio = store.audio_artifact().unwrap().unwrap();
        assert!(audio.ends_with("audio_cache/audio.m4a"));
    }

    #[test]
    fn test_patterns_match_names() {
        assert_eq!(raw_frame_pattern(FrameFormat::Png), "file%06d.png");
        assert_eq!(processed_frame_pattern(), "%06d.png");
        assert_eq!(raw_frame_name(42, FrameFormat::Jpeg), "file000042.jpg");
        assert_eq!(processed_frame_name(42), "000042.png");
    }

    proptest! {
        #[test]
        fn test_raw_and_processed_names_share_the_index(
            index in 0u32..1_000_000,
            quality in prop::bool::ANY,
        ) {
            let format = FrameFormat::from_quality(quality);
            let raw = raw_frame_name(index, format);
            let processed = processed_frame_name(index);

            prop_assert_eq!(parse_raw_frame_index(&raw, format), Some(index));
            prop_assert_eq!(parse_processed_index(&processed), Some(index));
            prop_assert_eq!(raw.len(), "file".len() + FRAME_INDEX_WIDTH + 4);
        }

        #[test]
        fn test_lexical_order_matches_numeric_order(
            a in 0u32..1_000_000,
            b in 0u32..1_000_000,
        ) {
            let fa = raw_frame_name(a, FrameFormat::Jpeg);
            let fb = raw_frame_name(b, FrameFormat::Jpeg);
            prop_assert_eq!(fa.cmp(&fb), a.cmp(&b));
        }

        #[test]
        fn test_names_of_other_format_never_parse(
            index in 0u32..1_000_000,
        ) {
            let png = raw_frame_name(index, FrameFormat::Png);
            prop_assert_eq!(parse_raw_frame_index(&png, FrameFormat::Jpeg), None);
            prop_assert_eq!(parse_processed_index(&png), None);
        }
    }
}
