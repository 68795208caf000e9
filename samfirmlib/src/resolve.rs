use crate::{
    constants::FOTA_BASE_URL,
    search::{Candidates, DigestMatch, DigestSearch, Prefixes, SearchSpace},
    version::{ParseVersionError, VersionTriple},
};

use std::collections::HashSet;

use log::{debug, info, warn};
use reqwest::StatusCode;
use thiserror::Error;
use xmltree::{Element, XMLNode};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Failed to fetch {0}: {1}")]
    Fetch(String, #[source] reqwest::Error),
    #[error("{0} returned HTTP {1}")]
    BadHttpResponse(String, StatusCode),
    #[error("Version document has neither a latest version nor digests")]
    NoDigests,
    #[error("No baseline version available and no prefix rule for region {0}")]
    NoBaseline(String),
    #[error("Search exhausted: matched {matched} of {total} digests")]
    Exhausted { matched: usize, total: usize },
    #[error("Search task failed: {0}")]
    SearchTask(#[from] tokio::task::JoinError),
    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] ParseVersionError),
    #[error("XML parse error: {0}")]
    XmlParseError(#[from] xmltree::ParseError),
    #[error("HTTP client error: {0}")]
    RequestError(#[from] reqwest::Error),
}

/// Contents of a `version.xml` or `version.test.xml` document.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VersionDocument {
    /// Plainly published version, if any
    pub latest: Option<String>,
    /// Digests of withheld versions
    pub digests: Vec<String>,
}

fn collect_digests(elem: &Element, out: &mut Vec<String>) {
    for child in elem.children.iter().filter_map(XMLNode::as_element) {
        if child.name == "version" {
            for upgrade in child.children.iter()
                .filter_map(XMLNode::as_element)
                .filter(|e| e.name == "upgrade")
            {
                out.extend(upgrade.children.iter()
                    .filter_map(XMLNode::as_element)
                    .filter(|e| e.name == "value")
                    .filter_map(|e| e.get_text())
                    .map(|t| t.trim().to_owned())
                    .filter(|t| !t.is_empty()));
            }
        }

        collect_digests(child, out);
    }
}

impl VersionDocument {
    pub fn parse(data: &[u8]) -> Result<Self, ResolveError> {
        let root = Element::parse(data)?;

        let latest = root.get_child("firmware")
            .and_then(|e| e.get_child("version"))
            .and_then(|e| e.get_child("latest"))
            .and_then(|e| e.get_text())
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty());

        let mut digests = vec![];
        collect_digests(&root, &mut digests);

        Ok(Self { latest, digests })
    }

    /// The latest value, unless it is a digest rather than a version.
    pub fn readable_latest(&self) -> Option<&str> {
        self.latest.as_deref().filter(|l| l.parse::<VersionTriple>().is_ok())
    }

    /// Digests to recover. An unreadable latest value is a digest as well.
    pub fn targets(&self) -> Vec<String> {
        let mut targets = vec![];

        if let Some(latest) = &self.latest {
            if self.readable_latest().is_none() {
                targets.push(latest.clone());
            }
        }
        for d in &self.digests {
            if !targets.contains(d) {
                targets.push(d.clone());
            }
        }

        targets
    }
}

/// Which regions a [`PrefixRule`] applies to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegionMatch {
    Exact(String),
    StartsWith(String),
}

impl RegionMatch {
    fn matches(&self, region: &str) -> bool {
        match self {
            Self::Exact(r) => region == r,
            Self::StartsWith(p) => region.starts_with(p.as_str()),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrefixRule {
    pub regions: Vec<RegionMatch>,
    /// Build id infixes placed after the model code, tried in order
    pub prefixes: Vec<String>,
}

/// Regional build id conventions for synthesizing search prefixes when no
/// baseline version exists. The first matching rule wins. Regions matching
/// no rule are not searched at all.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrefixTable {
    rules: Vec<PrefixRule>,
}

impl PrefixTable {
    pub fn new(rules: Vec<PrefixRule>) -> Self {
        Self { rules }
    }

    pub fn lookup(&self, region: &str) -> Option<&[String]> {
        self.rules.iter()
            .find(|r| r.regions.iter().any(|m| m.matches(region)))
            .map(|r| r.prefixes.as_slice())
    }

    /// Search prefixes synthesized from the model name, one set per infix.
    pub fn baselines(&self, model: &str, region: &str) -> Vec<Prefixes> {
        let code = model.replace("SM-", "").replace('-', "");
        let csc = if region.len() == 3 {
            format!("{code}{region}")
        } else {
            format!("{code}OXM")
        };

        self.lookup(region)
            .unwrap_or_default()
            .iter()
            .map(|p| Prefixes {
                pda: format!("{code}{p}"),
                csc: csc.clone(),
                cp: Some(format!("{code}{p}")),
            })
            .collect()
    }
}

impl Default for PrefixTable {
    fn default() -> Self {
        fn rule(regions: &[RegionMatch], prefixes: &[&str]) -> PrefixRule {
            PrefixRule {
                regions: regions.to_vec(),
                prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            }
        }
        let exact = |r: &str| RegionMatch::Exact(r.to_owned());

        Self::new(vec![
            rule(&[exact("CHC"), exact("CHN")], &["ZCS", "ZCU", "ZHU"]),
            rule(&[exact("EUX"), RegionMatch::StartsWith("E".to_owned())], &["XXU", "DBT", "OXM"]),
            rule(&[exact("KOO")], &["KSU", "SKC", "KTC"]),
            rule(&[exact("XAA")], &["UEU", "TMB", "ATT"]),
        ])
    }
}

/// Snapshot passed to the search progress callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SearchProgress {
    pub attempts: u64,
    pub total_attempts: u64,
    pub matched: usize,
    pub total_digests: usize,
}

/// Digests to recover and the prefixes to search them with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchPlan {
    pub digests: Vec<String>,
    pub baselines: Vec<Prefixes>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchMode {
    /// Stop at the first match
    First,
    /// Continue until every digest is matched
    All,
}

/// Run the candidate search for every baseline in order. Digests matched with
/// one baseline are not searched for again with the next.
pub fn run_search(
    plan: &SearchPlan,
    space: &SearchSpace,
    mode: SearchMode,
    progress: &mut dyn FnMut(SearchProgress),
) -> Result<Vec<DigestMatch>, ResolveError> {
    let mut remaining: HashSet<String> = plan.digests.iter()
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect();
    let total_digests = remaining.len();
    let total_attempts = space.len() * plan.baselines.len() as u64;
    let mut completed_attempts = 0;
    let mut matches = vec![];

    for prefixes in &plan.baselines {
        if remaining.is_empty() {
            break;
        }

        debug!("Searching with prefixes: {prefixes:?}");

        let prior = matches.len();
        let offset = completed_attempts;
        let mut search = DigestSearch::new(Candidates::new(prefixes, space), &remaining)
            .with_progress(|attempts, matched| progress(SearchProgress {
                attempts: offset + attempts,
                total_attempts,
                matched: prior + matched,
                total_digests,
            }));

        for m in &mut search {
            info!("Recovered version [{}/{total_digests}]: {}", matches.len() + 1, m.version);
            remaining.remove(&m.digest);
            matches.push(m);

            if mode == SearchMode::First {
                return Ok(matches);
            }
        }

        completed_attempts += search.attempts();
    }

    if matches.is_empty() {
        return Err(ResolveError::Exhausted { matched: 0, total: total_digests });
    } else if !remaining.is_empty() {
        warn!("{} of {total_digests} digests could not be recovered", remaining.len());
    }

    Ok(matches)
}

/// Type for resolving the firmware version to download from the FOTA version
/// documents.
pub struct VersionResolver {
    client: reqwest::Client,
    base_url: String,
    space: SearchSpace,
    table: PrefixTable,
}

impl VersionResolver {
    pub fn new(ignore_tls_validation: bool) -> Result<Self, ResolveError> {
        let client = reqwest::ClientBuilder::new()
            .danger_accept_invalid_certs(ignore_tls_validation)
            .build()?;

        Ok(Self {
            client,
            base_url: FOTA_BASE_URL.to_owned(),
            space: SearchSpace::default(),
            table: PrefixTable::default(),
        })
    }

    pub fn base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_owned();
        self
    }

    pub fn search_space(mut self, space: SearchSpace) -> Self {
        self.space = space;
        self
    }

    pub fn prefix_table(mut self, table: PrefixTable) -> Self {
        self.table = table;
        self
    }

    fn document_url(&self, region: &str, model: &str, test: bool) -> String {
        format!(
            "{}/firmware/{region}/{model}/version{}.xml",
            self.base_url,
            if test { ".test" } else { "" },
        )
    }

    pub async fn fetch_document(
        &self,
        region: &str,
        model: &str,
        test: bool,
    ) -> Result<VersionDocument, ResolveError> {
        let url = self.document_url(region, model, test);
        debug!("Fetching version document: {url}");

        let r = self.client.get(&url)
            .send()
            .await
            .map_err(|e| ResolveError::Fetch(url.clone(), e))?;

        let status = r.status();
        if !status.is_success() {
            return Err(ResolveError::BadHttpResponse(url, status));
        }

        let data = r.bytes().await.map_err(|e| ResolveError::Fetch(url, e))?;

        VersionDocument::parse(&data)
    }

    /// Figure out the digests and search prefixes for a document without a
    /// plain version. The production document supplies the baseline when it
    /// can be fetched. Otherwise the prefix table is consulted.
    pub async fn plan(
        &self,
        region: &str,
        model: &str,
        doc: &VersionDocument,
    ) -> Result<SearchPlan, ResolveError> {
        let digests = doc.targets();
        if digests.is_empty() {
            return Err(ResolveError::NoDigests);
        }

        let baseline = match self.fetch_document(region, model, false).await {
            Ok(d) => d.latest,
            Err(e) => {
                debug!("No production baseline: {e}");
                None
            }
        };

        let baselines = match baseline.as_deref().map(str::parse::<VersionTriple>) {
            Some(Ok(v)) => {
                info!("Using production version as baseline: {v}");
                vec![Prefixes::from_baseline(&v)]
            }
            other => {
                if let Some(Err(e)) = other {
                    warn!("Ignoring unusable production version: {e}");
                }

                let baselines = self.table.baselines(model, region);
                if baselines.is_empty() {
                    return Err(ResolveError::NoBaseline(region.to_owned()));
                }

                info!("Synthesized {} baselines from model name", baselines.len());
                baselines
            }
        };

        Ok(SearchPlan { digests, baselines })
    }

    async fn search(
        &self,
        plan: SearchPlan,
        mode: SearchMode,
        mut progress: impl FnMut(SearchProgress) + Send + 'static,
    ) -> Result<Vec<DigestMatch>, ResolveError> {
        let space = self.space.clone();

        info!("Searching {} candidates for {} digests",
              space.len() * plan.baselines.len() as u64, plan.digests.len());

        tokio::task::spawn_blocking(move || run_search(&plan, &space, mode, &mut progress))
            .await?
    }

    /// Resolve the version string to download. A plainly published version is
    /// returned unmodified. Otherwise the first candidate matching one of the
    /// published digests is returned. The test document's digests take
    /// precedence over its latest value, which is only used if none of them
    /// can be recovered.
    pub async fn resolve(
        &self,
        region: &str,
        model: &str,
        test: bool,
        progress: impl FnMut(SearchProgress) + Send + 'static,
    ) -> Result<String, ResolveError> {
        let doc = self.fetch_document(region, model, test).await?;
        let latest = doc.readable_latest();

        if let Some(latest) = latest {
            if !test || doc.targets().is_empty() {
                return Ok(latest.to_owned());
            }
        }

        let plan = self.plan(region, model, &doc).await?;

        match self.search(plan, SearchMode::First, progress).await {
            Ok(mut matches) => Ok(matches.remove(0).version),
            Err(e @ ResolveError::Exhausted { .. }) => match latest {
                Some(latest) => {
                    warn!("{e}; using published latest version");
                    Ok(latest.to_owned())
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Recover every withheld version from the test document.
    pub async fn resolve_all(
        &self,
        region: &str,
        model: &str,
        progress: impl FnMut(SearchProgress) + Send + 'static,
    ) -> Result<Vec<DigestMatch>, ResolveError> {
        let doc = self.fetch_document(region, model, true).await?;
        let plan = self.plan(region, model, &doc).await?;

        self.search(plan, SearchMode::All, progress).await
    }
}
