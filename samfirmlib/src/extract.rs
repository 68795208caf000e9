use crate::constants::EXTRACT_BUFFER_SIZE;

use std::{
    error::Error as StdError,
    fs::{self, File},
    io::{self, Cursor, Read, Write},
    path::{Component as PathComponent, Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};
use thiserror::Error;
use zip::{read::read_zipfile_from_stream, result::ZipError};

/// Bytes of a nested tar kept around so that a failed streaming extraction can
/// be retried from disk from the very beginning.
const REPLAY_LIMIT: usize = 1024 * 1024;

#[cfg(unix)]
const DISK_FULL_CODES: &[i32] = &[28]; // ENOSPC
#[cfg(windows)]
const DISK_FULL_CODES: &[i32] = &[39, 112]; // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
#[cfg(not(any(unix, windows)))]
const DISK_FULL_CODES: &[i32] = &[];

const DISK_FULL_MESSAGES: &[&str] = &[
    "no space left on device",
    "not enough space",
    "disk is full",
];

/// Whether an I/O error, or any error in its source chain, means the output
/// device is out of space.
pub fn is_disk_full(e: &io::Error) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(e);

    while let Some(err) = current {
        if let Some(code) = err.downcast_ref::<io::Error>().and_then(|e| e.raw_os_error()) {
            if DISK_FULL_CODES.contains(&code) {
                return true;
            }
        }

        let msg = err.to_string().to_ascii_lowercase();
        if DISK_FULL_MESSAGES.iter().any(|m| msg.contains(m)) {
            return true;
        }

        current = err.source();
    }

    false
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("No space left on device while writing {0:?}")]
    DiskFull(PathBuf, #[source] io::Error),
    #[error("Failed to write {0:?}: {1}")]
    Write(PathBuf, #[source] io::Error),
    #[error("Failed to read data for {0:?}: {1}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to read input stream: {0}")]
    Source(#[source] io::Error),
    #[error("Invalid archive: {0}")]
    Archive(#[from] ZipError),
    #[error("Invalid tar archive: {0}")]
    Tar(#[source] io::Error),
}

impl ExtractError {
    /// Fatal errors are never handed to another strategy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DiskFull(_, _))
    }
}

enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

impl CopyError {
    fn at(self, path: &Path) -> ExtractError {
        match self {
            Self::Read(e) => ExtractError::Read(path.to_owned(), e),
            Self::Write(e) if is_disk_full(&e) => ExtractError::DiskFull(path.to_owned(), e),
            Self::Write(e) => ExtractError::Write(path.to_owned(), e),
        }
    }
}

fn copy_buffered(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    buf: &mut [u8],
) -> Result<u64, CopyError> {
    let mut total = 0;

    loop {
        let n = match reader.read(buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };

        writer.write_all(&buf[..n]).map_err(CopyError::Write)?;
        total += n as u64;
    }

    writer.flush().map_err(CopyError::Write)?;

    Ok(total)
}

/// Firmware components selectable for extraction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Component {
    Ap,
    Bl,
    Cp,
    Csc,
    HomeCsc,
}

impl Component {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Ap => "AP",
            Self::Bl => "BL",
            Self::Cp => "CP",
            Self::Csc => "CSC",
            Self::HomeCsc => "HOME_CSC",
        }
    }
}

/// Selects archive entries by their `TAG_` name prefix. An empty filter
/// selects everything.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ComponentFilter {
    components: Vec<Component>,
}

impl ComponentFilter {
    pub fn new(components: impl IntoIterator<Item = Component>) -> Self {
        let mut result = Self::default();
        for c in components {
            if !result.components.contains(&c) {
                result.components.push(c);
            }
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.components.is_empty() {
            return true;
        }

        let upper = name.to_ascii_uppercase();
        self.components.iter()
            .any(|c| upper.strip_prefix(c.tag()).map_or(false, |rest| rest.starts_with('_')))
    }
}

/// Destination for extracted files. Exists so that tests can simulate
/// write failures.
pub trait OutputFs {
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write>>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

impl<T: OutputFs + ?Sized> OutputFs for Arc<T> {
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write>> {
        (**self).create(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        (**self).create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        (**self).remove_file(path)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFs;

impl OutputFs for LocalFs {
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write>> {
        Ok(Box::new(File::create(path)?))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExtractSummary {
    /// Archive entries written out
    pub extracted: usize,
    /// Archive entries rejected by the filter or for having unsafe paths
    pub skipped: usize,
    /// Files unpacked from nested tar archives
    pub nested: usize,
    /// Nested tar archives that could not be unpacked by either method
    pub failed: usize,
}

/// Turns an input stream error into EOF so the archive reader never sees it.
/// The zip reader panics on errors while skipping over an entry, so the error
/// is stashed here and reported after the archive reader gives up.
struct FaultLatch<R> {
    inner: R,
    error: Option<io::Error>,
}

impl<R: Read> Read for FaultLatch<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.error.is_some() {
            return Ok(0);
        }

        match self.inner.read(buf) {
            Err(e) if e.kind() != io::ErrorKind::Interrupted => {
                self.error = Some(e);
                Ok(0)
            }
            r => r,
        }
    }
}

/// Read-only view of a borrowed stream. Remembers the first bytes read so a
/// failed pass can be replayed.
struct ReplayReader<'a> {
    inner: &'a mut dyn Read,
    head: Vec<u8>,
    overflowed: bool,
}

impl<'a> ReplayReader<'a> {
    fn new(inner: &'a mut dyn Read) -> Self {
        Self {
            inner,
            head: vec![],
            overflowed: false,
        }
    }
}

impl Read for ReplayReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;

        if !self.overflowed {
            if self.head.len() + n <= REPLAY_LIMIT {
                self.head.extend_from_slice(&buf[..n]);
            } else {
                self.overflowed = true;
                self.head = vec![];
            }
        }

        Ok(n)
    }
}

/// Path relative to the destination, or `None` if it would escape it.
fn safe_relative(path: &Path) -> Option<PathBuf> {
    let mut result = PathBuf::new();

    for c in path.components() {
        match c {
            PathComponent::Normal(p) => result.push(p),
            PathComponent::CurDir => {}
            _ => return None,
        }
    }

    if result.as_os_str().is_empty() {
        None
    } else {
        Some(result)
    }
}

fn is_tar_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".tar") || lower.ends_with(".tar.md5")
}

/// Unpacks the decrypted firmware zip, one entry at a time, into a
/// destination directory.
pub struct Extractor<F = LocalFs> {
    dest: PathBuf,
    filter: ComponentFilter,
    fs: F,
    buf: Vec<u8>,
}

impl Extractor<LocalFs> {
    pub fn new(dest: impl Into<PathBuf>, filter: ComponentFilter) -> Self {
        Self::with_fs(dest, filter, LocalFs)
    }
}

impl<F: OutputFs> Extractor<F> {
    pub fn with_fs(dest: impl Into<PathBuf>, filter: ComponentFilter, fs: F) -> Self {
        Self {
            dest: dest.into(),
            filter,
            fs,
            buf: vec![0u8; EXTRACT_BUFFER_SIZE],
        }
    }

    /// Stream `path` from `reader`. The partial file is removed on failure.
    fn write_stream(&mut self, path: &Path, reader: &mut dyn Read) -> Result<u64, ExtractError> {
        let result = match self.fs.create(path) {
            Ok(mut writer) => copy_buffered(reader, &mut writer, &mut self.buf),
            Err(e) => Err(CopyError::Write(e)),
        };

        result.map_err(|e| {
            if let Err(re) = self.fs.remove_file(path) {
                if re.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove partial file {path:?}: {re}");
                }
            }
            e.at(path)
        })
    }

    fn extract_tar(&mut self, reader: &mut dyn Read, name: &str) -> Result<usize, ExtractError> {
        let mut archive = tar::Archive::new(reader);
        let mut count = 0;

        for entry in archive.entries().map_err(ExtractError::Tar)? {
            let mut entry = entry.map_err(ExtractError::Tar)?;
            let entry_type = entry.header().entry_type();
            let entry_path = entry.path().map_err(ExtractError::Tar)?.into_owned();

            let Some(rel) = safe_relative(&entry_path) else {
                warn!("{name}: Skipping unsafe path: {entry_path:?}");
                continue;
            };
            let path = self.dest.join(rel);

            if entry_type.is_dir() {
                self.fs.create_dir_all(&path).map_err(|e| CopyError::Write(e).at(&path))?;
                continue;
            } else if !entry_type.is_file() {
                debug!("{name}: Skipping non-regular entry: {entry_path:?}");
                continue;
            }

            if let Some(parent) = path.parent() {
                self.fs.create_dir_all(parent).map_err(|e| CopyError::Write(e).at(parent))?;
            }

            info!("  Extracting from {name}: {entry_path:?} ({} bytes)", entry.size());
            self.write_stream(&path, &mut entry)?;
            count += 1;
        }

        Ok(count)
    }

    /// Spool the nested tar to a temporary file in the destination and extract
    /// it from there. The temporary file is always removed.
    fn extract_tar_from_disk(&mut self, replay: ReplayReader<'_>, name: &str) -> Result<usize, ExtractError> {
        let ReplayReader { inner, head, overflowed } = replay;
        if overflowed {
            warn!("{name}: Data consumed by the streaming attempt cannot be replayed");
        }

        let mut spool = tempfile::Builder::new()
            .prefix(".samfirm-")
            .suffix(".tar")
            .tempfile_in(&self.dest)
            .map_err(|e| CopyError::Write(e).at(&self.dest))?;
        let spool_path = spool.path().to_owned();

        let mut source = Cursor::new(head).chain(inner);
        copy_buffered(&mut source, spool.as_file_mut(), &mut self.buf)
            .map_err(|e| e.at(&spool_path))?;

        let mut file = spool.reopen().map_err(|e| ExtractError::Read(spool_path, e))?;

        self.extract_tar(&mut file, name)
    }

    fn extract_nested_tar(&mut self, entry: &mut dyn Read, name: &str) -> Result<usize, ExtractError> {
        let mut replay = ReplayReader::new(entry);

        match self.extract_tar(&mut replay, name) {
            Ok(n) => Ok(n),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Streaming extraction of {name} failed: {e}");
                info!("Falling back to disk-based extraction of {name}");

                match self.extract_tar_from_disk(replay, name) {
                    Ok(n) => Ok(n),
                    Err(e) if e.is_fatal() => Err(e),
                    Err(e) => {
                        warn!("Disk-based extraction of {name} also failed: {e}");
                        Ok(0)
                    }
                }
            }
        }
    }

    fn extract_entries<R: Read>(&mut self, source: &mut R) -> Result<ExtractSummary, ExtractError> {
        let mut summary = ExtractSummary::default();

        while let Some(mut entry) = read_zipfile_from_stream(source)? {
            let name = entry.name().to_owned();

            if !self.filter.matches(&name) {
                debug!("Skipping: {name}");
                summary.skipped += 1;
                continue;
            }

            let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
                warn!("Skipping unsafe path: {name:?}");
                summary.skipped += 1;
                continue;
            };
            let path = self.dest.join(rel);

            if entry.is_dir() {
                self.fs.create_dir_all(&path).map_err(|e| CopyError::Write(e).at(&path))?;
                continue;
            }

            if let Some(parent) = path.parent() {
                self.fs.create_dir_all(parent).map_err(|e| CopyError::Write(e).at(parent))?;
            }

            info!("Extracting: {name} ({} bytes)", entry.size());

            if is_tar_name(&name) {
                match self.extract_nested_tar(&mut entry, &name)? {
                    0 => summary.failed += 1,
                    n => {
                        summary.extracted += 1;
                        summary.nested += n;
                    }
                }
            } else {
                self.write_stream(&path, &mut entry)?;
                summary.extracted += 1;
            }
        }

        Ok(summary)
    }

    /// Extract every selected entry of the zip archive read from `reader`.
    /// Stops at the end of the archive, leaving any trailing data unread.
    pub fn extract_zip<R: Read>(&mut self, reader: R) -> Result<ExtractSummary, ExtractError> {
        let mut source = FaultLatch { inner: reader, error: None };
        let result = self.extract_entries(&mut source);

        let summary = match (result, source.error) {
            (Err(e), _) if e.is_fatal() => return Err(e),
            (_, Some(e)) => return Err(ExtractError::Source(e)),
            (r, None) => r?,
        };

        if summary.skipped > 0 {
            info!("Total files skipped: {}", summary.skipped);
        }
        info!("Total files extracted: {}", summary.extracted);
        if summary.failed > 0 {
            warn!("Nested archives that yielded no files: {}", summary.failed);
        }

        if !self.filter.is_empty() && summary.extracted == 0 && summary.failed == 0 {
            let tags: Vec<_> = self.filter.components().iter().map(|c| c.tag()).collect();
            warn!("No files matched the selected components: {}", tags.join(", "));
        }

        Ok(summary)
    }
}
