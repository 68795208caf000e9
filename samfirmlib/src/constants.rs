/// Server publishing the version documents
pub const FOTA_BASE_URL: &str = "https://fota-cloud-dn.ospserver.net";

/// FUS server handling nonce generation and binary inform/init
pub const FUS_BASE_URL: &str = "https://neofussvr.sslcs.cdngc.net";

/// Server hosting the encrypted firmware archives
pub const DOWNLOAD_BASE_URL: &str = "http://cloud-neofussvr.samsungmobile.com";

/// User agent expected by FUS
pub const USER_AGENT: &str = "Kies2.0_FUS";

/// Status reported when no response was received at all (eg. DNS failure)
pub const STATUS_NO_RESPONSE: u16 = 0x385;

/// Status reported when a response body could not be read as text
pub const STATUS_UNREADABLE_BODY: u16 = 900;

/// Buffer size for copying archive entries to disk
pub const EXTRACT_BUFFER_SIZE: usize = 4 * 1024 * 1024;
