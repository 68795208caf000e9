use crate::{
    constants::{
        DOWNLOAD_BASE_URL, FUS_BASE_URL, STATUS_NO_RESPONSE,
        STATUS_UNREADABLE_BODY, USER_AGENT as FUS_USER_AGENT,
    },
    crypto::{CryptoError, DecryptionKey, FusCrypto},
    msg::MessageBuilder,
    session::{Endpoint, Session},
    version::VersionTriple,
};

use std::{
    borrow::Cow,
    fmt,
    path::Path,
    str,
    sync::Arc,
};

use bytes::Bytes;
use futures_core::Stream;
use log::{debug, trace};
use reqwest::{
    header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, USER_AGENT},
    RequestBuilder, Response,
    StatusCode,
};
use thiserror::Error;
use xmltree::Element;

const NON_UTF8_MSG: &str = "[Non-UTF-8 data]";

fn to_utf8_or_error_string(data: &[u8]) -> &str {
    str::from_utf8(data).unwrap_or(NON_UTF8_MSG)
}

#[derive(Debug, Error)]
pub enum FusError {
    #[error("No response from {0}: {1}")]
    NoResponse(Endpoint, #[source] reqwest::Error),
    #[error("{0} returned HTTP {1}")]
    BadHttpResponse(Endpoint, StatusCode),
    #[error("Could not read response body from {0}: {1}")]
    UnreadableBody(Endpoint, #[source] reqwest::Error),
    #[error("Server did not provide a nonce value")]
    NonceNotFound,
    #[error("Cannot call {0} in state {1:?}")]
    InvalidState(Endpoint, ClientState),
    #[error("Received unsuccessful FUS response: {0}")]
    FusBadResponse(String),
    #[error("Could not find field '{0}' in FUS response")]
    FusMissingField(String),
    #[error("Could not parse the value for field '{0}': '{1}'")]
    FusBadField(String, String),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("HTTP client error: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("XML parse error: {0}")]
    XmlParseError(#[from] xmltree::ParseError),
    #[error("XML error: {0}")]
    XmlError(#[from] xmltree::Error),
}

impl FusError {
    /// Status code describing the failure. HTTP statuses pass through while
    /// transport failures map to fixed sentinels outside the HTTP range.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NoResponse(_, _) => Some(STATUS_NO_RESPONSE),
            Self::UnreadableBody(_, _) => Some(STATUS_UNREADABLE_BODY),
            Self::BadHttpResponse(_, s) => Some(s.as_u16()),
            _ => None,
        }
    }
}

/// Position in the download handshake.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum ClientState {
    Unauthenticated,
    NonceObtained,
    Informed,
    Initialized,
    Downloading,
    Done,
    Failed,
}

/// A type representing the Authorization field for FUS requests.
#[derive(Debug, Default)]
struct Authorization {
    nonce: String,
    signature: String,
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // We do not support the legacy auth mechanism (unencrypted nonces), so
        // newauth is always set
        write!(
            f,
            "FUS nonce=\"{}\", signature=\"{}\", nc=\"\", type=\"\", realm=\"\", newauth=\"1\"",
            self.nonce,
            self.signature,
        )
    }
}

/// Base URLs of the vendor services.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoints {
    /// Nonce, inform and init
    pub fus: String,
    /// Binary download
    pub download: String,
}

impl Endpoints {
    pub fn url(&self, endpoint: Endpoint) -> String {
        let base = match endpoint {
            Endpoint::BinaryDownload => &self.download,
            _ => &self.fus,
        };

        format!("{}{}", base.trim_end_matches('/'), endpoint.path())
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            fus: FUS_BASE_URL.to_owned(),
            download: DOWNLOAD_BASE_URL.to_owned(),
        }
    }
}

/// Binary metadata from a successful inform response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryDescriptor {
    /// Encrypted archive size in bytes
    pub size: u64,
    /// Archive filename. Guaranteed to have no directory component
    pub filename: String,
    /// Logic value for deriving the decryption key
    pub logic_value: String,
    /// Server-side storage path
    pub path: String,
    /// Version the server resolved the request to
    pub version: String,
    /// CRC32 of the encrypted archive
    pub crc: Option<u32>,
    /// Human-readable model/marketing name
    pub model_name: Option<String>,
    /// Friendly OS version name
    pub os_version: Option<String>,
}

impl BinaryDescriptor {
    /// Parse the `FUSMsg` root of an inform response. The five core fields
    /// must be present and non-empty.
    pub fn from_inform_response(root: &Element) -> Result<Self, FusError> {
        let required = |path: &[&str], name: &str| -> Result<String, FusError> {
            get_elem_text(root, path)
                .filter(|v| !v.is_empty())
                .map(|v| v.into_owned())
                .ok_or_else(|| FusError::FusMissingField(name.to_owned()))
        };
        let put = |name: &str| required(&["FUSBody", "Put", name, "Data"], name);
        let optional = |name: &str| {
            get_elem_text(root, &["FUSBody", "Put", name, "Data"])
                .filter(|v| !v.is_empty())
                .map(|v| v.into_owned())
        };

        let size_str = put("BINARY_BYTE_SIZE")?;
        let size = size_str.trim().parse()
            .map_err(|_| FusError::FusBadField("BINARY_BYTE_SIZE".to_owned(), size_str.clone()))?;

        let binary_name = put("BINARY_NAME")?;
        let filename = Path::new(&binary_name)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FusError::FusBadField("BINARY_NAME".to_owned(), binary_name.clone()))?
            .to_owned();

        let logic_value = put("LOGIC_VALUE_FACTORY")?;
        let path = put("MODEL_PATH")?;
        let version = required(
            &["FUSBody", "Results", "LATEST_FW_VERSION", "Data"],
            "LATEST_FW_VERSION",
        )?;

        let crc = match optional("BINARY_CRC") {
            Some(v) => Some(v.trim().parse()
                .map_err(|_| FusError::FusBadField("BINARY_CRC".to_owned(), v.clone()))?),
            None => None,
        };

        Ok(Self {
            size,
            filename,
            logic_value,
            path,
            version,
            crc,
            model_name: optional("DEVICE_MODEL_DISPLAYNAME"),
            os_version: optional("CURRENT_OS_VERSION"),
        })
    }

    /// Split the filename into (target filename, enc extension). If the server-
    /// provided filename does not have an enc extension, the extension is set
    /// to "enc4".
    pub fn split_filename(&self) -> (String, String) {
        let p = Path::new(&self.filename);

        if let (Some(s), Some(e)) = (
            p.file_stem().and_then(|s| s.to_str()),
            p.extension().and_then(|e| e.to_str()),
        ) {
            if e.starts_with("enc") {
                return (s.to_owned(), e.to_owned());
            }
        }

        (self.filename.clone(), "enc4".to_owned())
    }

    /// Compute the archive decryption key. `.enc2` archives use the legacy
    /// scheme and everything else uses the logic check scheme.
    pub fn decryption_key(&self, crypto: &dyn FusCrypto, region: &str, model: &str) -> DecryptionKey {
        let (_, ext) = self.split_filename();

        if ext == "enc2" {
            DecryptionKey::from_legacy(region, model, &self.version)
        } else {
            DecryptionKey::from_logic_check(crypto, &self.version, &self.logic_value)
        }
    }
}

/// Everything needed to fetch the encrypted archive, either directly or
/// through an external downloader.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
}

/// Builder type for creating FUS clients with non-default behavior.
#[derive(Clone)]
pub struct FusClientBuilder {
    crypto: Arc<dyn FusCrypto>,
    messages: Arc<dyn MessageBuilder>,
    endpoints: Endpoints,
    ignore_tls_validation: bool,
}

impl FusClientBuilder {
    pub fn new(crypto: Arc<dyn FusCrypto>, messages: Arc<dyn MessageBuilder>) -> Self {
        Self {
            crypto,
            messages,
            endpoints: Endpoints::default(),
            ignore_tls_validation: false,
        }
    }

    pub fn endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Ignore TLS certificate validation when performing HTTPS requests. By
    /// default, TLS certificate validation is enabled.
    pub fn ignore_tls_validation(mut self, value: bool) -> Self {
        self.ignore_tls_validation = value;
        self
    }

    /// Build a client with a fresh, empty session.
    pub fn build(&self) -> Result<FusClient, FusError> {
        self.build_with_session(Session::new())
    }

    /// Build a client that takes ownership of an existing session.
    pub fn build_with_session(&self, session: Session) -> Result<FusClient, FusError> {
        debug!("TLS validation enabled: {}", !self.ignore_tls_validation);

        let client = reqwest::ClientBuilder::new()
            .danger_accept_invalid_certs(self.ignore_tls_validation)
            .cookie_provider(session.cookies())
            .referer(false)
            .build()?;

        Ok(FusClient {
            client,
            crypto: self.crypto.clone(),
            messages: self.messages.clone(),
            endpoints: self.endpoints.clone(),
            session,
            state: ClientState::Unauthenticated,
        })
    }
}

/// Type for interacting with the FUS service. The handshake must proceed in
/// order: [`Self::generate_nonce`], [`Self::binary_inform`],
/// [`Self::binary_init`], [`Self::prepare_download`]. Any failure moves the
/// client to [`ClientState::Failed`], from which there is no recovery.
pub struct FusClient {
    client: reqwest::Client,
    crypto: Arc<dyn FusCrypto>,
    messages: Arc<dyn MessageBuilder>,
    endpoints: Endpoints,
    session: Session,
    state: ClientState,
}

impl FusClient {
    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Record the outcome of the pipeline that consumed the download.
    pub fn finish(&mut self, success: bool) {
        self.state = if success { ClientState::Done } else { ClientState::Failed };
    }

    fn check_state(&self, endpoint: Endpoint, allowed: &[ClientState]) -> Result<(), FusError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(FusError::InvalidState(endpoint, self.state))
        }
    }

    fn fail<T>(&mut self, e: FusError) -> Result<T, FusError> {
        self.state = ClientState::Failed;
        Err(e)
    }

    /// Build the Authorization header from the current session nonce.
    fn authorization(&self) -> Authorization {
        Authorization {
            nonce: self.session.nonce().to_owned(),
            signature: if self.session.has_nonce() {
                self.crypto.signature(self.session.nonce_decrypted())
            } else {
                String::new()
            },
        }
    }

    /// If the response carries a NONCE header, replace the session nonce
    /// before anything else can be signed. Returns whether a rotation
    /// happened.
    fn update_session(&mut self, response: &Response) -> Result<bool, FusError> {
        match response.headers().get("NONCE") {
            Some(value) => {
                let nonce = value.to_str()
                    .map_err(|_| FusError::FusBadField("NONCE".to_owned(),
                        to_utf8_or_error_string(value.as_bytes()).to_owned()))?;
                self.session.rotate(nonce, &*self.crypto)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply the common FUS headers, send the request, and rotate the nonce if
    /// the server issued a new one. Non-2xx statuses are errors.
    async fn send(&mut self, endpoint: Endpoint, request: RequestBuilder) -> Result<Response, FusError> {
        let auth = self.authorization();
        self.session.mark_consumed(endpoint);

        let r = request
            .header(AUTHORIZATION, auth.to_string())
            .header(USER_AGENT, FUS_USER_AGENT)
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| FusError::NoResponse(endpoint, e))?;

        self.update_session(&r)?;

        let status = r.status();
        if !status.is_success() {
            return Err(FusError::BadHttpResponse(endpoint, status));
        }

        Ok(r)
    }

    async fn request_nonce(&mut self) -> Result<(), FusError> {
        let url = self.endpoints.url(Endpoint::GenerateNonce);
        debug!("Requesting nonce from: {url}");

        let request = self.client.post(&url).header(CONTENT_LENGTH, 0);
        let r = self.send(Endpoint::GenerateNonce, request).await?;

        if !r.headers().contains_key("NONCE") {
            return Err(FusError::NonceNotFound);
        }

        Ok(())
    }

    /// Obtain the first nonce of the session.
    pub async fn generate_nonce(&mut self) -> Result<(), FusError> {
        self.check_state(Endpoint::GenerateNonce, &[ClientState::Unauthenticated])?;

        match self.request_nonce().await {
            Ok(()) => {
                self.state = ClientState::NonceObtained;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Make sure the session holds a nonce that has not been consumed by a
    /// different endpoint. The server normally issues a fresh nonce with every
    /// response. If it did not, a new one is requested.
    async fn ensure_nonce_for(&mut self, endpoint: Endpoint) -> Result<(), FusError> {
        if !self.session.can_sign_for(endpoint) {
            debug!("Nonce was not reissued; requesting a new one for {endpoint}");
            self.request_nonce().await?;
        }

        Ok(())
    }

    /// Perform a FUS XML request, parsing the response body as XML and
    /// interpreting the FUS status code.
    async fn execute_fus_xml_request(
        &mut self,
        endpoint: Endpoint,
        body: &Element,
    ) -> Result<Element, FusError> {
        let url = self.endpoints.url(endpoint);
        debug!("FUS URL: {url}");

        let mut buf = vec![];
        body.write(&mut buf)?;

        trace!("FUS request: {:?}", to_utf8_or_error_string(&buf));

        let request = self.client.post(&url).body(buf);
        let r = self.send(endpoint, request).await?;
        let data = r.text().await
            .map_err(|e| FusError::UnreadableBody(endpoint, e))?;

        trace!("FUS response: {data:?}");

        let root = Element::parse(data.as_bytes())?;

        // HTTP 200, but there might still be a FUS error
        let status = get_elem_text(&root, &["FUSBody", "Results", "Status"])
            .ok_or_else(|| FusError::FusBadResponse("Missing FUS status field".to_owned()))?;

        if status != "200" {
            return Err(FusError::FusBadResponse(status.to_string()));
        }

        Ok(root)
    }

    async fn inform(
        &mut self,
        version: &VersionTriple,
        region: &str,
        model: &str,
        imei: &str,
    ) -> Result<BinaryDescriptor, FusError> {
        self.ensure_nonce_for(Endpoint::BinaryInform).await?;

        let req_root = self.messages.build_inform_request(
            &version.request_version(),
            region,
            model,
            imei,
            self.session.nonce_decrypted(),
        );

        let resp_root = self.execute_fus_xml_request(Endpoint::BinaryInform, &req_root).await?;

        BinaryDescriptor::from_inform_response(&resp_root)
    }

    /// Ask the server which binary serves the given version.
    pub async fn binary_inform(
        &mut self,
        version: &VersionTriple,
        region: &str,
        model: &str,
        imei: &str,
    ) -> Result<BinaryDescriptor, FusError> {
        self.check_state(Endpoint::BinaryInform, &[ClientState::NonceObtained])?;

        match self.inform(version, region, model, imei).await {
            Ok(d) => {
                self.state = ClientState::Informed;
                Ok(d)
            }
            Err(e) => self.fail(e),
        }
    }

    async fn init(&mut self, info: &BinaryDescriptor) -> Result<(), FusError> {
        self.ensure_nonce_for(Endpoint::BinaryInit).await?;

        let req_root = self.messages.build_init_request(
            &info.filename,
            self.session.nonce_decrypted(),
        );

        self.execute_fus_xml_request(Endpoint::BinaryInit, &req_root).await?;

        Ok(())
    }

    /// Inform the service of the intention to download the binary.
    pub async fn binary_init(&mut self, info: &BinaryDescriptor) -> Result<(), FusError> {
        self.check_state(Endpoint::BinaryInit, &[ClientState::Informed])?;

        match self.init(info).await {
            Ok(()) => {
                self.state = ClientState::Initialized;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Sign the download request with the current nonce. The same request may
    /// be handed to [`Self::download`] or to an external downloader.
    pub async fn prepare_download(&mut self, info: &BinaryDescriptor) -> Result<DownloadRequest, FusError> {
        self.check_state(Endpoint::BinaryDownload, &[ClientState::Initialized])?;

        if let Err(e) = self.ensure_nonce_for(Endpoint::BinaryDownload).await {
            return self.fail(e);
        }

        let auth = self.authorization();
        self.session.mark_consumed(Endpoint::BinaryDownload);
        self.state = ClientState::Downloading;

        // This intentionally does not use RequestBuilder.query() because FUS
        // returns HTTP 405 if the requested filename is URL-encoded.
        let url = format!(
            "{}?file={}{}",
            self.endpoints.url(Endpoint::BinaryDownload),
            info.path,
            info.filename,
        );

        Ok(DownloadRequest {
            url,
            headers: vec![
                ("User-Agent", FUS_USER_AGENT.to_owned()),
                ("Authorization", auth.to_string()),
            ],
        })
    }

    /// Start streaming the encrypted archive.
    pub async fn download(
        &mut self,
        request: &DownloadRequest,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>>, FusError> {
        self.check_state(Endpoint::BinaryDownload, &[ClientState::Downloading])?;

        debug!("Requesting binary from: {}", request.url);

        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let r = builder.send().await
            .map_err(|e| FusError::NoResponse(Endpoint::BinaryDownload, e));
        let r = match r {
            Ok(r) => r,
            Err(e) => return self.fail(e),
        };

        if let Err(e) = self.update_session(&r) {
            return self.fail(e);
        }

        let status = r.status();
        if !status.is_success() {
            return self.fail(FusError::BadHttpResponse(Endpoint::BinaryDownload, status));
        }

        Ok(r.bytes_stream())
    }
}

fn get_elem_text<'a>(elem: &'a Element, path: &[&str]) -> Option<Cow<'a, str>> {
    let mut result = Some(elem);

    for p in path {
        result = result.and_then(|e| e.get_child(*p));
    }

    result.map(|e| e.get_text().unwrap_or(Cow::Borrowed("")))
}
