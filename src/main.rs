use std::{
    env,
    fmt,
    fs::File,
    io::{self, stderr, Stderr},
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, Level, log_enabled};
use serde::{Deserialize, Serialize};

use progresslib::{ProgressBar, ProgressDrawMode, ProgressUnit};
use samfirmlib::{
    acquire::Acquirer,
    crypto::{FusCrypto, FusKeyCrypto, FusKeys},
    extract::{Component, ComponentFilter},
    fallback::ExternalDownloader,
    fus::{Endpoints, FusClientBuilder, FusError},
    msg::FusMessageBuilder,
    resolve::{SearchProgress, VersionResolver},
    search::SearchSpace,
    version::VersionTriple,
};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const DEFAULT_YEARS_BACK: u32 = 5;
const DEFAULT_YEARS_AHEAD: u32 = 2;

/// Create a new progress bar with the specified length. The progress bar is not
/// immediately rendered.
fn create_progress_bar(len: u64, unit: ProgressUnit) -> ProgressBar<Stderr> {
    let mut bar = ProgressBar::new(stderr(), len).with_unit(unit);
    if log_enabled!(Level::Debug) {
        // The escape sequences for the interactive progress bar would clobber
        // log messages.
        bar.set_mode(Some(ProgressDrawMode::Append));
    }

    bar
}

/// Attach the FUS status code, if any, to a protocol error.
fn fus_context(e: FusError, what: &str) -> anyhow::Error {
    let msg = match e.status() {
        Some(s) => format!("{what} (status {s})"),
        None => what.to_owned(),
    };

    anyhow::Error::new(e).context(msg)
}

/// Load FUS keys from the following list in order:
/// * User-supplied command line arguments
/// * Environment variables
/// * Config file
fn load_keys(opts: &Opts, config: &Config) -> Result<FusKeys> {
    let fixed_key = opts.fus_fixed_key
        .as_ref()
        .or(config.fus_fixed_key.as_ref())
        .ok_or_else(|| anyhow!("No FUS fixed key argument or variable specified"))?
        .as_bytes();
    let flexible_key_suffix = opts.fus_flexible_key_suffix
        .as_ref()
        .or(config.fus_flexible_key_suffix.as_ref())
        .ok_or_else(|| anyhow!("No FUS flexible key suffix argument or variable specified"))?
        .as_bytes();

    Ok(FusKeys::new(fixed_key, flexible_key_suffix)?)
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Trace => f.write_str("trace"),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct Config {
    fus_fixed_key: Option<String>,
    fus_flexible_key_suffix: Option<String>,
    search_years_back: Option<u32>,
    search_years_ahead: Option<u32>,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(format!("{PKG_NAME}.conf"));
        p
    })
}

fn load_config_file(user_path: Option<&Path>) -> Result<Option<Config>> {
    let default_path = default_config_path();
    let path = user_path.or(default_path.as_deref());

    match path {
        Some(p) => {
            let file = match File::open(p) {
                Ok(f) => f,
                Err(e) => {
                    return if e.kind() == io::ErrorKind::NotFound && user_path.is_none() {
                        Ok(None)
                    } else {
                        Err(e).context(format!("Could not open file: {p:?}"))
                    };
                }
            };

            let config = serde_json::from_reader(file)
                .context(format!("Could not parse config file: {p:?}"))?;

            Ok(Some(config))
        }
        None => Ok(None),
    }
}

/// Download, decrypt, and extract official firmware from FUS.
#[derive(Clone, Debug, Parser)]
#[command(author, version, disable_version_flag = true)]
struct Opts {
    /// Device's model number (eg. SM-S916B)
    #[arg(short, long)]
    model: String,
    /// Region/CSC code (eg. EUX)
    #[arg(short, long)]
    region: String,
    /// Device IMEI or serial number
    ///
    /// FUS requires a valid identifier for the model being queried.
    #[arg(short, long)]
    imei: String,
    /// Resolve the version from the test server
    ///
    /// Test versions are only published as MD5 digests. The version is
    /// recovered by searching candidate versions derived from the production
    /// version, or from the model name if there is none.
    #[arg(short, long)]
    test: bool,
    /// Version to download instead of the latest
    ///
    /// The format is "<PDA>/<CSC>[/<CP>]". If <CP> is omitted, the device is
    /// assumed to have no separate modem firmware.
    #[arg(short, long, conflicts_with_all = ["test", "list_test_versions"])]
    version: Option<VersionTriple>,
    /// Extract the AP component
    #[arg(long)]
    ap: bool,
    /// Extract the BL component
    #[arg(long)]
    bl: bool,
    /// Extract the CP component
    #[arg(long)]
    cp: bool,
    /// Extract the CSC component
    #[arg(long)]
    csc: bool,
    /// Extract the HOME_CSC component
    ///
    /// If no component options are passed, every component is extracted.
    #[arg(long)]
    home_csc: bool,
    /// Output directory for extracted files
    ///
    /// Defaults to "<model>_<region>" in the current directory.
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
    /// Print every version withheld on the test server and exit
    #[arg(long)]
    list_test_versions: bool,
    /// Do not retry with aria2c if the streaming download fails
    #[arg(long)]
    no_fallback: bool,
    /// Path to the aria2c executable
    #[arg(long, env = "SAMFIRM_ARIA2C", default_value = "aria2c", value_name = "PATH")]
    aria2c: PathBuf,
    /// Number of years before the current year to search test versions for
    #[arg(long, env = "SAMFIRM_SEARCH_YEARS_BACK", value_name = "YEARS")]
    search_years_back: Option<u32>,
    /// Number of years after the current year to search test versions for
    #[arg(long, env = "SAMFIRM_SEARCH_YEARS_AHEAD", value_name = "YEARS")]
    search_years_ahead: Option<u32>,
    /// Override the FOTA server base URL
    #[arg(long, env = "SAMFIRM_FOTA_URL", value_name = "URL")]
    fota_url: Option<String>,
    /// Override the FUS server base URL
    #[arg(long, env = "SAMFIRM_FUS_URL", value_name = "URL")]
    fus_url: Option<String>,
    /// Override the download server base URL
    #[arg(long, env = "SAMFIRM_DOWNLOAD_URL", value_name = "URL")]
    download_url: Option<String>,
    /// Set logging verbosity
    ///
    /// By default, only warnings are printed out. If set to 'debug', protocol
    /// and pipeline details, such as each extracted file, are printed out. If
    /// set to 'trace', every HTTP response is also printed out, which can be
    /// extremely verbose. This option overrides the RUST_LOG environment
    /// variable, which would otherwise be respected if this option was not
    /// passed.
    #[arg(long, value_enum)]
    loglevel: Option<LogLevel>,
    /// Ignore TLS validation for HTTPS connections
    ///
    /// By default, all HTTPS connections (eg. to FUS) will validate the TLS
    /// certificate against the system's CA trust store.
    #[arg(long)]
    ignore_tls_validation: bool,
    /// FUS fixed key
    ///
    /// If unspecified, the key is loaded from the `FUS_FIXED_KEY` environment
    /// variable, followed by the `fus_fixed_key` config file variable.
    #[arg(long, env = "FUS_FIXED_KEY", hide_env_values = true)]
    fus_fixed_key: Option<String>,
    /// FUS flexible key suffix
    ///
    /// If unspecified, the key is loaded from the `FUS_FLEXIBLE_KEY_SUFFIX`
    /// environment variable, followed by the `fus_flexible_key_suffix` config
    /// file variable.
    #[arg(long, env = "FUS_FLEXIBLE_KEY_SUFFIX", hide_env_values = true)]
    fus_flexible_key_suffix: Option<String>,
    /// Config file path
    ///
    /// If unspecified, the default config file path is used. The config file
    /// can store the FUS keys and search settings to avoid needing to set
    /// environment variables or pass them as command-line arguments.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl Opts {
    fn component_filter(&self) -> ComponentFilter {
        let selected = [
            (self.ap, Component::Ap),
            (self.bl, Component::Bl),
            (self.cp, Component::Cp),
            (self.csc, Component::Csc),
            (self.home_csc, Component::HomeCsc),
        ];

        ComponentFilter::new(selected.into_iter().filter(|(s, _)| *s).map(|(_, c)| c))
    }

    fn endpoints(&self) -> Endpoints {
        let mut endpoints = Endpoints::default();
        if let Some(url) = &self.fus_url {
            endpoints.fus = url.clone();
        }
        if let Some(url) = &self.download_url {
            endpoints.download = url.clone();
        }
        endpoints
    }

    fn search_space(&self, config: &Config) -> SearchSpace {
        SearchSpace::current(
            self.search_years_back.or(config.search_years_back).unwrap_or(DEFAULT_YEARS_BACK),
            self.search_years_ahead.or(config.search_years_ahead).unwrap_or(DEFAULT_YEARS_AHEAD),
        )
    }

    fn redacted(&self) -> Self {
        let mut opts = self.clone();
        for key in [&mut opts.fus_fixed_key, &mut opts.fus_flexible_key_suffix] {
            if key.is_some() {
                *key = Some("<redacted>".to_owned());
            }
        }
        opts
    }
}

/// Progress callback for the version search. The bar is cleared once the
/// search finishes and the callback is dropped.
fn search_progress() -> impl FnMut(SearchProgress) + Send + 'static {
    let mut bar = create_progress_bar(0, ProgressUnit::Items);

    move |p| {
        if bar.length() != p.total_attempts {
            if let Err(e) = bar.set_length(p.total_attempts) {
                debug!("Failed to update progress bar: {e}");
            }
        }
        bar.set_label(format!("Searching [{}/{}]", p.matched, p.total_digests));
        if let Err(e) = bar.advance(p.attempts.saturating_sub(bar.position())) {
            debug!("Failed to update progress bar: {e}");
        }
    }
}

async fn list_test_versions(opts: &Opts, resolver: &VersionResolver) -> Result<()> {
    let matches = resolver.resolve_all(&opts.region, &opts.model, search_progress()).await
        .context("Failed to recover test versions")?;

    for m in matches {
        println!("{}", m.version);
    }

    Ok(())
}

async fn run(opts: Opts, log_keys: bool) -> Result<()> {
    let config = load_config_file(opts.config.as_deref())?.unwrap_or_default();
    if log_keys {
        debug!("Config: {:#?}", config);
    }

    let mut resolver = VersionResolver::new(opts.ignore_tls_validation)
        .context("Could not initialize FOTA client")?
        .search_space(opts.search_space(&config));
    if let Some(url) = &opts.fota_url {
        resolver = resolver.base_url(url);
    }

    if opts.list_test_versions {
        return list_test_versions(&opts, &resolver).await;
    }

    let keys = load_keys(&opts, &config)?;
    if log_keys {
        debug!("Keys: {:?}", keys);
    }

    println!();
    println!("  Model: {}", opts.model);
    println!("  Region: {}", opts.region);
    if opts.test {
        println!("  Using test firmware server");
    }

    let version = match &opts.version {
        Some(v) => v.clone(),
        None => {
            let v = resolver.resolve(&opts.region, &opts.model, opts.test, search_progress()).await
                .context("Failed to resolve latest firmware version")?;
            v.parse::<VersionTriple>()
                .with_context(|| format!("Server returned invalid version: {v:?}"))?
        }
    };

    println!();
    println!("  Latest version:");
    println!("    PDA: {}", version.pda);
    println!("    CSC: {}", version.csc);
    println!("    MODEM: {}", version.cp.as_deref().unwrap_or("N/A"));

    let crypto: Arc<dyn FusCrypto> = Arc::new(FusKeyCrypto::new(keys));
    let messages = Arc::new(FusMessageBuilder::new(crypto.clone()));
    let mut client = FusClientBuilder::new(crypto.clone(), messages)
        .endpoints(opts.endpoints())
        .ignore_tls_validation(opts.ignore_tls_validation)
        .build()
        .context("Could not initialize FUS client")?;

    client.generate_nonce().await
        .map_err(|e| fus_context(e, "Failed to obtain nonce"))?;

    let info = client.binary_inform(&version, &opts.region, &opts.model, &opts.imei).await
        .map_err(|e| fus_context(e, "Failed to fetch binary info"))?;

    debug!("Full binary info: {:#?}", info);

    client.binary_init(&info).await
        .map_err(|e| fus_context(e, "Failed to initialize binary download"))?;

    let key = info.decryption_key(&*crypto, &opts.region, &opts.model);
    if log_keys {
        debug!("Decryption key: {:?}", key);
    }

    println!();
    if let Some(name) = &info.model_name {
        println!("  Model name: {name}");
    }
    if let Some(os) = &info.os_version {
        println!("  OS: {os}");
    }
    println!("  File: {}{}", info.path, info.filename);
    println!("  Size: {} bytes", info.size);

    let dest = opts.output.clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}_{}", opts.model, opts.region)));
    let dest = match env::current_dir() {
        Ok(cwd) => cwd.join(dest),
        Err(_) => dest,
    };
    println!();
    println!("Saving to: {}", dest.display());

    let fallback = if opts.no_fallback {
        None
    } else {
        Some(ExternalDownloader::new(&opts.aria2c))
    };
    let acquirer = Acquirer::new(&dest, opts.component_filter()).fallback(fallback);

    let mut bar = create_progress_bar(info.size, ProgressUnit::Bytes);
    bar.set_label("Downloading");

    let result = acquirer.acquire(&mut client, &info, key, |n| {
        if let Err(e) = bar.advance(n) {
            debug!("Failed to update progress bar: {e}");
        }
    }).await;

    bar.finish()?;
    drop(bar);

    let summary = result.context("Failed to download firmware")?;

    println!();
    println!("Extracted {} files to {}", summary.extracted + summary.nested, dest.display());
    if summary.failed > 0 {
        println!("Could not unpack {} nested archives", summary.failed);
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();

    if let Some(l) = opts.loglevel {
        env::set_var("RUST_LOG", format!("{PKG_NAME}={l},samfirmlib={l}"));
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .init();

    let log_keys_var = format!("{}_LOG_KEYS", PKG_NAME.to_uppercase());
    let log_keys = matches!(env::var(log_keys_var), Ok(v) if v == "true");

    if log_keys {
        debug!("Arguments: {:#?}", opts);
    } else {
        debug!("Arguments: {:#?}", opts.redacted());
    }

    if let Err(e) = run(opts, log_keys).await {
        eprintln!();
        eprintln!("======================== FAILED ========================");
        eprintln!("{e:?}");
        eprintln!("========================================================");
        process::exit(1);
    }
}
