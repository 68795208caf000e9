//! Download, decrypt, and extract a firmware archive. Streaming straight from
//! the server is attempted first so that the encrypted archive never touches
//! the disk. If that fails for any reason other than the disk filling up, the
//! archive is downloaded to a file with an external downloader and extracted
//! from there.

use crate::{
    crypto::DecryptionKey,
    decrypt::{crc32_of, CrcReader, DecryptReader},
    extract::{ComponentFilter, ExtractError, ExtractSummary, Extractor, LocalFs, OutputFs},
    fallback::{ExternalDownloader, FallbackError},
    fus::{BinaryDescriptor, DownloadRequest, FusClient, FusError},
};

use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::{Buf, Bytes};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::{sync::mpsc, task::{self, JoinError}};
use tokio_stream::StreamExt;

/// Number of network chunks buffered between the download and the extractor.
const CHANNEL_DEPTH: usize = 64;

type SharedFs = Arc<dyn OutputFs + Send + Sync>;

/// Failure of a single acquisition strategy.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Fus(#[from] FusError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Fallback(#[from] FallbackError),
    #[error("Expected CRC32 {expected:08X}, but have {actual:08X}")]
    Checksum { expected: u32, actual: u32 },
    #[error("Extraction task failed: {0}")]
    Task(#[from] JoinError),
}

impl StageError {
    /// Whether retrying with another strategy is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Extract(e) if e.is_fatal())
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("Failed to create output directory {0:?}: {1}")]
    CreateDir(PathBuf, #[source] io::Error),
    #[error("Failed to prepare download: {0}")]
    Prepare(#[source] FusError),
    #[error(transparent)]
    Fatal(StageError),
    #[error("Streaming download failed: {0}")]
    Stream(#[source] StageError),
    #[error("All download methods failed: streaming: {stream}; external downloader: {fallback}")]
    AllMethodsFailed {
        stream: StageError,
        fallback: StageError,
    },
}

/// Blocking [`Read`] over chunks sent from the async side.
struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self { rx, current: Bytes::new() }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(data)) => self.current = data,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);

        Ok(n)
    }
}

fn is_artifact(name: &str) -> bool {
    let enc_or_aria2 = match name.rsplit_once('.') {
        Some((_, ext)) => ext.starts_with("enc") || ext == "aria2",
        None => false,
    };

    enc_or_aria2 || (name.starts_with(".aria2_") && name.ends_with(".conf"))
}

/// Delete leftover encrypted archives and downloader control files from
/// `dir`. Returns the number of files removed.
pub fn cleanup_artifacts(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            debug!("Cannot list {dir:?} for cleanup: {e}");
            return 0;
        }
    };

    let mut removed = 0;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if !is_artifact(&name) || !entry.file_type().map_or(false, |t| t.is_file()) {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!("Deleted: {:?}", entry.path());
                removed += 1;
            }
            Err(e) => warn!("Failed to delete {:?}: {e}", entry.path()),
        }
    }

    removed
}

fn extract_decrypted<R: Read>(
    reader: R,
    key: &DecryptionKey,
    dest: PathBuf,
    filter: ComponentFilter,
    fs: SharedFs,
) -> Result<(ExtractSummary, DecryptReader<R>), ExtractError> {
    let mut reader = DecryptReader::new(reader, key);
    let summary = Extractor::with_fs(dest, filter, fs).extract_zip(&mut reader)?;

    // Consume the rest so the padding and checksum cover the whole archive
    io::copy(&mut reader, &mut io::sink()).map_err(ExtractError::Source)?;

    Ok((summary, reader))
}

fn extract_file(
    path: &Path,
    expected_crc: Option<u32>,
    key: &DecryptionKey,
    dest: PathBuf,
    filter: ComponentFilter,
    fs: SharedFs,
) -> Result<ExtractSummary, StageError> {
    let open = || File::open(path).map_err(|e| ExtractError::Read(path.to_owned(), e));

    if let Some(expected) = expected_crc {
        let actual = crc32_of(open()?)
            .map_err(|e| ExtractError::Read(path.to_owned(), e))?;
        if actual != expected {
            return Err(StageError::Checksum { expected, actual });
        }
        debug!("CRC32 verified: {actual:08X}");
    }

    let (summary, _) = extract_decrypted(open()?, key, dest, filter, fs)?;

    Ok(summary)
}

/// Runs the acquisition strategies in order for a single archive.
#[derive(Clone)]
pub struct Acquirer {
    dest: PathBuf,
    filter: ComponentFilter,
    fallback: Option<ExternalDownloader>,
    fs: SharedFs,
}

impl Acquirer {
    pub fn new(dest: impl Into<PathBuf>, filter: ComponentFilter) -> Self {
        Self {
            dest: dest.into(),
            filter,
            fallback: None,
            fs: Arc::new(LocalFs),
        }
    }

    /// Where extracted files are written. Defaults to [`LocalFs`].
    pub fn output_fs(mut self, fs: impl OutputFs + Send + Sync + 'static) -> Self {
        self.fs = Arc::new(fs);
        self
    }

    /// Downloader to use when streaming fails. [`None`] disables the fallback.
    pub fn fallback(mut self, downloader: Option<ExternalDownloader>) -> Self {
        self.fallback = downloader;
        self
    }

    async fn stream_extract(
        &self,
        client: &mut FusClient,
        request: &DownloadRequest,
        info: &BinaryDescriptor,
        key: DecryptionKey,
        progress: &mut dyn FnMut(u64),
    ) -> Result<ExtractSummary, StageError> {
        let stream = client.download(request).await?;
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

        let dest = self.dest.clone();
        let filter = self.filter.clone();
        let fs = self.fs.clone();
        let task = task::spawn_blocking(move || {
            extract_decrypted(CrcReader::new(ChannelReader::new(rx)), &key, dest, filter, fs)
                .map(|(summary, reader)| (summary, reader.get_ref().count(), reader.get_ref().crc32()))
        });

        tokio::pin!(stream);

        while let Some(item) = stream.next().await {
            let item = item.map_err(|e| io::Error::new(io::ErrorKind::Other, e));
            let failed = item.is_err();
            if let Ok(data) = &item {
                progress(data.len() as u64);
            }

            // The receiver is gone if extraction already failed
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }

        drop(tx);

        let (summary, count, crc) = task.await??;

        if count != info.size {
            warn!("Downloaded {count} bytes, but server reported {} bytes", info.size);
        }
        match info.crc {
            Some(expected) if expected != crc => {
                warn!("Expected CRC32 {expected:08X}, but have {crc:08X}; files were already extracted");
            }
            Some(_) => debug!("CRC32 verified: {crc:08X}"),
            None => {}
        }

        Ok(summary)
    }

    async fn fallback_extract(
        &self,
        downloader: &ExternalDownloader,
        request: &DownloadRequest,
        info: &BinaryDescriptor,
        key: DecryptionKey,
    ) -> Result<ExtractSummary, StageError> {
        let path = self.dest.join(&info.filename);

        downloader.download(request, &path).await?;

        let dest = self.dest.clone();
        let filter = self.filter.clone();
        let fs = self.fs.clone();
        let expected_crc = info.crc;

        task::spawn_blocking(move || extract_file(&path, expected_crc, &key, dest, filter, fs)).await?
    }

    /// Acquire the archive described by `info` into the output directory.
    /// `client` must have completed [`FusClient::binary_init`]. `progress` is
    /// called with the size of every chunk streamed from the server.
    pub async fn acquire(
        &self,
        client: &mut FusClient,
        info: &BinaryDescriptor,
        key: DecryptionKey,
        mut progress: impl FnMut(u64),
    ) -> Result<ExtractSummary, AcquireError> {
        tokio::fs::create_dir_all(&self.dest)
            .await
            .map_err(|e| AcquireError::CreateDir(self.dest.clone(), e))?;

        let request = client.prepare_download(info).await.map_err(AcquireError::Prepare)?;

        let stream_err = match self.stream_extract(client, &request, info, key, &mut progress).await {
            Ok(summary) => {
                client.finish(true);
                return Ok(summary);
            }
            Err(e) if e.is_fatal() => {
                client.finish(false);
                cleanup_artifacts(&self.dest);
                return Err(AcquireError::Fatal(e));
            }
            Err(e) => e,
        };

        let Some(downloader) = &self.fallback else {
            client.finish(false);
            return Err(AcquireError::Stream(stream_err));
        };

        warn!("Streaming download failed: {stream_err}");
        info!("Retrying with external downloader");

        let result = self.fallback_extract(downloader, &request, info, key).await;
        cleanup_artifacts(&self.dest);
        client.finish(result.is_ok());

        match result {
            Ok(summary) => Ok(summary),
            Err(e) if e.is_fatal() => Err(AcquireError::Fatal(e)),
            Err(e) => Err(AcquireError::AllMethodsFailed {
                stream: stream_err,
                fallback: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use assert_matches::assert_matches;
    use tokio::task::JoinHandle;
    use zip::{write::FileOptions, CompressionMethod, ZipWriter};

    use crate::{
        crypto::FusFileAes128,
        fus::ClientState,
        session::Endpoint,
        testutil::{client_for, serve, status_body, MockResponse, RecordedRequest, TestCrypto},
        version::VersionTriple,
    };

    use super::*;

    const FILENAME: &str = "SM-TEST_1_FAC.zip.enc4";

    fn inform_body(size: usize, crc: u32) -> String {
        format!(
            "<FUSMsg><FUSBody>\
             <Results><Status>200</Status>\
             <LATEST_FW_VERSION><Data>A/B/A/A</Data></LATEST_FW_VERSION></Results>\
             <Put>\
             <BINARY_BYTE_SIZE><Data>{size}</Data></BINARY_BYTE_SIZE>\
             <BINARY_NAME><Data>{FILENAME}</Data></BINARY_NAME>\
             <LOGIC_VALUE_FACTORY><Data>abcdefghijklmnop</Data></LOGIC_VALUE_FACTORY>\
             <MODEL_PATH><Data>/neofus/9/</Data></MODEL_PATH>\
             <BINARY_CRC><Data>{crc}</Data></BINARY_CRC>\
             </Put></FUSBody></FUSMsg>"
        )
    }

    fn key() -> DecryptionKey {
        DecryptionKey::from_logic_check(&TestCrypto, "A/B/A/A", "abcdefghijklmnop")
    }

    fn encrypted_archive() -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);

        for (name, data) in [("BL_test.bin", &b"bootloader"[..]), ("CSC_test.bin", b"csc")] {
            writer.start_file(name, options).unwrap();
            writer.write_all(data).unwrap();
        }

        let zip = writer.finish().unwrap().into_inner();
        FusFileAes128::new(&key()).encrypt_padded(&zip)
    }

    /// Client that has completed the handshake. The last request it makes is
    /// answered with `download`.
    async fn ready_client(
        archive: &[u8],
        crc: u32,
        download: MockResponse,
    ) -> (FusClient, BinaryDescriptor, JoinHandle<Vec<RecordedRequest>>) {
        let (base, server) = serve(vec![
            MockResponse::ok(Some("N1"), ""),
            MockResponse::ok(Some("N2"), inform_body(archive.len(), crc)),
            MockResponse::ok(Some("N3"), status_body()),
            download,
        ]).await;

        let mut client = client_for(&base);
        client.generate_nonce().await.unwrap();
        let version = VersionTriple::new("PDA", "CSC", None).unwrap();
        let info = client.binary_inform(&version, "XAA", "SM-TEST", "0").await.unwrap();
        client.binary_init(&info).await.unwrap();

        (client, info, server)
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir).unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_is_artifact() {
        assert!(is_artifact("SM-TEST_1_FAC.zip.enc4"));
        assert!(is_artifact("SM-TEST_1_FAC.zip.enc2"));
        assert!(is_artifact("SM-TEST_1_FAC.zip.enc4.aria2"));
        assert!(is_artifact(".aria2_0123456789abcdef.conf"));
        assert!(!is_artifact("AP_TEST.tar.md5"));
        assert!(!is_artifact("encrypted.img"));
        assert!(!is_artifact("aria2.conf"));
    }

    #[test]
    fn test_cleanup_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.zip.enc4", "a.zip.enc4.aria2", ".aria2_abc.conf", "BL_keep.tar.md5"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        assert_eq!(cleanup_artifacts(dir.path()), 3);
        assert_eq!(files_in(dir.path()), ["BL_keep.tar.md5"]);
        assert_eq!(cleanup_artifacts(&dir.path().join("missing")), 0);
    }

    #[test]
    fn test_channel_reader() {
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(Ok(Bytes::from_static(b"hel"))).unwrap();
        tx.try_send(Ok(Bytes::new())).unwrap();
        tx.try_send(Ok(Bytes::from_static(b"lo"))).unwrap();
        drop(tx);

        let mut data = vec![];
        ChannelReader::new(rx).read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello");

        let (tx, rx) = mpsc::channel(4);
        tx.try_send(Ok(Bytes::from_static(b"x"))).unwrap();
        tx.try_send(Err(io::Error::new(io::ErrorKind::Other, "reset"))).unwrap();
        drop(tx);

        let err = ChannelReader::new(rx).read_to_end(&mut vec![]).unwrap_err();
        assert_eq!(err.to_string(), "reset");
    }

    #[tokio::test]
    async fn test_stream_success() {
        let archive = encrypted_archive();
        let crc = crc32_of(Cursor::new(&archive)).unwrap();
        let (mut client, info, server) =
            ready_client(&archive, crc, MockResponse::ok(None, archive.clone())).await;
        let dest = tempfile::tempdir().unwrap();

        let mut streamed = 0;
        let summary = Acquirer::new(dest.path(), ComponentFilter::default())
            .acquire(&mut client, &info, key(), |n| streamed += n)
            .await
            .unwrap();

        assert_eq!(summary.extracted, 2);
        assert_eq!(streamed, archive.len() as u64);
        assert_eq!(client.state(), ClientState::Done);
        assert_eq!(files_in(dest.path()), ["BL_test.bin", "CSC_test.bin"]);
        assert_eq!(fs::read(dest.path().join("BL_test.bin")).unwrap(), b"bootloader");

        let requests = server.await.unwrap();
        assert!(requests[3].line.starts_with(
            "GET /NF_DownloadBinaryForMass.do?file=/neofus/9/SM-TEST_1_FAC.zip.enc4"));
    }

    #[tokio::test]
    async fn test_stream_checksum_mismatch_warns() {
        let archive = encrypted_archive();
        let (mut client, info, _server) =
            ready_client(&archive, 1, MockResponse::ok(None, archive.clone())).await;
        let dest = tempfile::tempdir().unwrap();

        let summary = Acquirer::new(dest.path(), ComponentFilter::new([crate::extract::Component::Csc]))
            .acquire(&mut client, &info, key(), |_| {})
            .await
            .unwrap();

        assert_eq!(summary.extracted, 1);
        assert_eq!(files_in(dest.path()), ["CSC_test.bin"]);
    }

    #[tokio::test]
    async fn test_stream_failure_without_fallback() {
        let archive = encrypted_archive();
        let (mut client, info, _server) = ready_client(&archive, 0, MockResponse::status(500)).await;
        let dest = tempfile::tempdir().unwrap();

        let result = Acquirer::new(dest.path(), ComponentFilter::default())
            .acquire(&mut client, &info, key(), |_| {})
            .await;

        assert_matches!(result, Err(AcquireError::Stream(StageError::Fus(
            FusError::BadHttpResponse(Endpoint::BinaryDownload, s)))) if s.as_u16() == 500);
        assert_eq!(client.state(), ClientState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_all_methods_failed() {
        let archive = encrypted_archive();
        let (mut client, info, _server) = ready_client(&archive, 0, MockResponse::status(500)).await;
        let dest = tempfile::tempdir().unwrap();

        let result = Acquirer::new(dest.path(), ComponentFilter::default())
            .fallback(Some(ExternalDownloader::new("false")))
            .acquire(&mut client, &info, key(), |_| {})
            .await;

        assert_matches!(result, Err(AcquireError::AllMethodsFailed {
            stream: StageError::Fus(FusError::BadHttpResponse(_, _)),
            fallback: StageError::Fallback(FallbackError::ExitStatus(_)),
        }));
        assert!(files_in(dest.path()).is_empty());
        assert_eq!(client.state(), ClientState::Failed);
    }

    /// Output that runs out of space on the first write.
    struct NoSpaceFs;

    struct NoSpaceWriter;

    impl Write for NoSpaceWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "No space left on device"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl OutputFs for NoSpaceFs {
        fn create(&self, path: &Path) -> io::Result<Box<dyn Write>> {
            File::create(path)?;
            Ok(Box::new(NoSpaceWriter))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disk_full_skips_fallback() {
        let archive = encrypted_archive();
        let crc = crc32_of(Cursor::new(&archive)).unwrap();
        let (mut client, info, _server) =
            ready_client(&archive, crc, MockResponse::ok(None, archive.clone())).await;
        let dest = tempfile::tempdir().unwrap();
        fs::write(dest.path().join("stale.zip.enc4"), b"x").unwrap();
        fs::write(dest.path().join("stale.zip.enc4.aria2"), b"x").unwrap();
        fs::write(dest.path().join(".aria2_stale.conf"), b"x").unwrap();

        let markers = tempfile::tempdir().unwrap();
        let marker = markers.path().join("ran");
        let downloader = ExternalDownloader::new("sh").args([
            "-c".to_owned(),
            format!("touch '{}'", marker.display()),
            "sh".to_owned(),
        ]);

        let result = Acquirer::new(dest.path(), ComponentFilter::default())
            .output_fs(NoSpaceFs)
            .fallback(Some(downloader))
            .acquire(&mut client, &info, key(), |_| {})
            .await;

        assert_matches!(result, Err(AcquireError::Fatal(StageError::Extract(
            ExtractError::DiskFull(p, _)))) if p == dest.path().join("BL_test.bin"));
        assert!(!marker.exists());
        assert!(files_in(dest.path()).is_empty());
        assert_eq!(client.state(), ClientState::Failed);
    }

    /// Downloader that copies `fixture` to the configured output.
    #[cfg(unix)]
    fn copying_downloader(fixture: &Path) -> ExternalDownloader {
        let script = format!(
            r#"
            conf="${{1#--conf-path=}}"
            while IFS= read -r line; do
                case "$line" in
                    dir=*) dir="${{line#dir=}}" ;;
                    out=*) out="${{line#out=}}" ;;
                esac
            done < "$conf"
            cp '{}' "$dir/$out"
            "#,
            fixture.display(),
        );

        ExternalDownloader::new("sh").args(["-c".to_owned(), script, "sh".to_owned()])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fallback_success() {
        let archive = encrypted_archive();
        let crc = crc32_of(Cursor::new(&archive)).unwrap();
        let fixtures = tempfile::tempdir().unwrap();
        let fixture = fixtures.path().join("archive.bin");
        fs::write(&fixture, &archive).unwrap();

        let (mut client, info, _server) = ready_client(&archive, crc, MockResponse::status(503)).await;
        let dest = tempfile::tempdir().unwrap();

        let summary = Acquirer::new(dest.path(), ComponentFilter::default())
            .fallback(Some(copying_downloader(&fixture)))
            .acquire(&mut client, &info, key(), |_| {})
            .await
            .unwrap();

        assert_eq!(summary.extracted, 2);
        assert_eq!(client.state(), ClientState::Done);
        assert_eq!(files_in(dest.path()), ["BL_test.bin", "CSC_test.bin"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fallback_checksum_mismatch() {
        let archive = encrypted_archive();
        let fixtures = tempfile::tempdir().unwrap();
        let fixture = fixtures.path().join("archive.bin");
        fs::write(&fixture, &archive).unwrap();

        let (mut client, info, _server) = ready_client(&archive, 1, MockResponse::status(503)).await;
        let dest = tempfile::tempdir().unwrap();

        let result = Acquirer::new(dest.path(), ComponentFilter::default())
            .fallback(Some(copying_downloader(&fixture)))
            .acquire(&mut client, &info, key(), |_| {})
            .await;

        assert_matches!(result, Err(AcquireError::AllMethodsFailed {
            fallback: StageError::Checksum { expected: 1, .. },
            ..
        }));
        assert!(files_in(dest.path()).is_empty());
    }
}
