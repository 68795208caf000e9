use crate::version::VersionTriple;

use std::collections::HashSet;

use chrono::Datelike;
use log::debug;

/// Year encoded by the letter `A`.
const BASE_YEAR: i32 = 2001;

/// Number of trailing characters of a PDA/CP id that vary between builds.
const PDA_SUFFIX_LEN: usize = 6;
/// Number of trailing characters of a CSC id that vary between builds.
const CSC_SUFFIX_LEN: usize = 5;

/// How often the progress callback fires.
pub const PROGRESS_INTERVAL: u64 = 100_000;

/// Letter encoding `year` in a version id, if it is representable.
pub fn year_letter(year: i32) -> Option<char> {
    let offset = year - BASE_YEAR;

    if (0..26).contains(&offset) {
        char::from_u32('A' as u32 + offset as u32)
    } else {
        None
    }
}

/// Alphabets of every variable position of a version id. These encode
/// assumptions about an undocumented scheme, so every axis is adjustable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchSpace {
    /// Update type, appended to the PDA and CP prefixes only
    pub update_types: Vec<char>,
    pub bootloaders: Vec<char>,
    pub release_trains: Vec<char>,
    pub years: Vec<char>,
    pub months: Vec<char>,
    pub serials: Vec<char>,
}

impl SearchSpace {
    /// Search space with a year window of `[year - years_back, year + years_ahead]`,
    /// clamped to the representable years.
    pub fn for_year(year: i32, years_back: u32, years_ahead: u32) -> Self {
        let start = year.saturating_sub(years_back as i32).max(BASE_YEAR);
        let end = year.saturating_add(years_ahead as i32).min(BASE_YEAR + 25);

        Self {
            update_types: vec!['U', 'S'],
            bootloaders: ('0'..='9').chain('A'..='Z').collect(),
            release_trains: ('A'..='Z').collect(),
            years: (start..=end).filter_map(year_letter).collect(),
            months: ('A'..='L').collect(),
            serials: ('1'..='9').chain('A'..='Z').collect(),
        }
    }

    /// Search space centered on the current local year.
    pub fn current(years_back: u32, years_ahead: u32) -> Self {
        Self::for_year(chrono::Local::now().year(), years_back, years_ahead)
    }

    fn axes(&self) -> [&[char]; 6] {
        [
            &self.update_types,
            &self.bootloaders,
            &self.release_trains,
            &self.years,
            &self.months,
            &self.serials,
        ]
    }

    /// Total number of candidates.
    pub fn len(&self) -> u64 {
        self.axes().iter().map(|a| a.len() as u64).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::current(5, 2)
    }
}

/// Fixed leading parts of each field of a candidate version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Prefixes {
    pub pda: String,
    pub csc: String,
    /// Absent when the device has no separate modem firmware
    pub cp: Option<String>,
}

fn strip_suffix_chars(s: &str, n: usize) -> &str {
    match s.char_indices().rev().nth(n - 1) {
        Some((i, _)) if i > 0 => &s[..i],
        _ => s,
    }
}

impl Prefixes {
    /// Derive the prefixes from a known version of the same device.
    pub fn from_baseline(baseline: &VersionTriple) -> Self {
        Self {
            pda: strip_suffix_chars(&baseline.pda, PDA_SUFFIX_LEN).to_owned(),
            csc: strip_suffix_chars(&baseline.csc, CSC_SUFFIX_LEN).to_owned(),
            cp: baseline.cp.as_deref()
                .filter(|cp| cp.chars().count() > PDA_SUFFIX_LEN)
                .map(|cp| strip_suffix_chars(cp, PDA_SUFFIX_LEN).to_owned()),
        }
    }
}

/// Iterator over every candidate version string in the fixed nesting order:
/// update type outermost, then bootloader, release train, year, month and
/// finally serial innermost.
pub struct Candidates<'a> {
    prefixes: &'a Prefixes,
    axes: [&'a [char]; 6],
    indices: [usize; 6],
    done: bool,
}

impl<'a> Candidates<'a> {
    pub fn new(prefixes: &'a Prefixes, space: &'a SearchSpace) -> Self {
        let axes = space.axes();

        Self {
            prefixes,
            axes,
            indices: [0; 6],
            done: axes.iter().any(|a| a.is_empty()),
        }
    }

    fn format(&self) -> String {
        let at = |i: usize| self.axes[i][self.indices[i]];
        let upd = at(0);
        let suffix: String = (1..6).map(at).collect();

        let mut candidate = format!("{}{upd}{suffix}/{}{suffix}", self.prefixes.pda, self.prefixes.csc);
        if let Some(cp) = &self.prefixes.cp {
            candidate.push('/');
            candidate.push_str(cp);
            candidate.push(upd);
            candidate.push_str(&suffix);
        }

        candidate
    }

    fn advance(&mut self) {
        for i in (0..self.indices.len()).rev() {
            self.indices[i] += 1;
            if self.indices[i] < self.axes[i].len() {
                return;
            }
            self.indices[i] = 0;
        }

        self.done = true;
    }
}

impl Iterator for Candidates<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let candidate = self.format();
        self.advance();

        Some(candidate)
    }
}

/// Lowercase hex MD5 of a candidate, as published by the server.
pub fn digest(candidate: &str) -> String {
    format!("{:x}", md5::compute(candidate.as_bytes()))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DigestMatch {
    pub digest: String,
    pub version: String,
}

/// Tests candidates against a set of target digests. Yields each match once
/// and stops as soon as every target has been matched.
pub struct DigestSearch<'a> {
    candidates: Candidates<'a>,
    targets: HashSet<String>,
    total: usize,
    attempts: u64,
    progress: Option<Box<dyn FnMut(u64, usize) + 'a>>,
}

impl<'a> DigestSearch<'a> {
    pub fn new<I, S>(candidates: Candidates<'a>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets: HashSet<String> = targets.into_iter()
            .map(|t| t.as_ref().trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        debug!("Searching for {} digests", targets.len());

        Self {
            candidates,
            total: targets.len(),
            targets,
            attempts: 0,
            progress: None,
        }
    }

    /// Call `f(attempts, matched)` every [`PROGRESS_INTERVAL`] attempts.
    pub fn with_progress(mut self, f: impl FnMut(u64, usize) + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn outstanding(&self) -> usize {
        self.targets.len()
    }

    pub fn matched(&self) -> usize {
        self.total - self.targets.len()
    }
}

impl Iterator for DigestSearch<'_> {
    type Item = DigestMatch;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.targets.is_empty() {
            let candidate = self.candidates.next()?;
            self.attempts += 1;

            if self.attempts % PROGRESS_INTERVAL == 0 {
                let matched = self.matched();
                if let Some(f) = &mut self.progress {
                    f(self.attempts, matched);
                }
            }

            let d = digest(&candidate);
            if self.targets.remove(&d) {
                debug!("Matched {d} after {} attempts", self.attempts);
                return Some(DigestMatch { digest: d, version: candidate });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_space() -> SearchSpace {
        SearchSpace {
            update_types: vec!['U', 'S'],
            bootloaders: vec!['1', '2'],
            release_trains: vec!['A', 'B'],
            years: vec!['X'],
            months: vec!['A', 'B', 'C'],
            serials: vec!['1', '2', '3'],
        }
    }

    fn prefixes() -> Prefixes {
        Prefixes::from_baseline(
            &"S916BXXU2AXA1/S916BOXM2AXA1/S916BXXU2AXA1".parse().unwrap())
    }

    #[test]
    fn test_year_letter() {
        assert_eq!(year_letter(2001), Some('A'));
        assert_eq!(year_letter(2024), Some('X'));
        assert_eq!(year_letter(2026), Some('Z'));
        assert_eq!(year_letter(2000), None);
        assert_eq!(year_letter(2027), None);
    }

    #[test]
    fn test_year_window() {
        let space = SearchSpace::for_year(2024, 5, 2);
        assert_eq!(space.years, vec!['S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z']);

        let space = SearchSpace::for_year(2026, 1, 2);
        assert_eq!(space.years, vec!['Y', 'Z']);

        let space = SearchSpace::for_year(2003, 5, 0);
        assert_eq!(space.years, vec!['A', 'B', 'C']);

        assert_eq!(space.months.len(), 12);
        assert_eq!(space.serials.len(), 35);
        assert_eq!(space.bootloaders.len(), 36);
    }

    #[test]
    fn test_prefixes() {
        assert_eq!(prefixes(), Prefixes {
            pda: "S916BXX".to_owned(),
            csc: "S916BOXM".to_owned(),
            cp: Some("S916BXX".to_owned()),
        });

        let p = Prefixes::from_baseline(&"S916BXXU2AXA1/S916BOXM2AXA1".parse().unwrap());
        assert_eq!(p.cp, None);

        let p = Prefixes::from_baseline(&"ABC/DE/XYZ".parse().unwrap());
        assert_eq!(p, Prefixes { pda: "ABC".to_owned(), csc: "DE".to_owned(), cp: None });
    }

    #[test]
    fn test_candidate_order() {
        let prefixes = prefixes();
        let space = small_space();
        let candidates: Vec<String> = Candidates::new(&prefixes, &space).collect();

        assert_eq!(candidates.len() as u64, space.len());
        assert_eq!(candidates[0], "S916BXXU1AXA1/S916BOXM1AXA1/S916BXXU1AXA1");
        assert_eq!(candidates[1], "S916BXXU1AXA2/S916BOXM1AXA2/S916BXXU1AXA2");
        assert_eq!(candidates[3], "S916BXXU1AXB1/S916BOXM1AXB1/S916BXXU1AXB1");
        assert_eq!(candidates.last().unwrap(), "S916BXXS2BXC3/S916BOXM2BXC3/S916BXXS2BXC3");
    }

    #[test]
    fn test_candidate_without_cp() {
        let prefixes = Prefixes { pda: "P".to_owned(), csc: "C".to_owned(), cp: None };
        let space = small_space();

        assert_eq!(Candidates::new(&prefixes, &space).next().unwrap(), "PU1AXA1/C1AXA1");
    }

    #[test]
    fn test_empty_axis() {
        let prefixes = prefixes();
        let mut space = small_space();
        space.years.clear();

        assert!(space.is_empty());
        assert_eq!(Candidates::new(&prefixes, &space).next(), None);
    }

    #[test]
    fn test_search_finds_known_candidate() {
        let prefixes = prefixes();
        let space = small_space();
        let wanted = "S916BXXS2AXB3/S916BOXM2AXB3/S916BXXS2AXB3";

        let mut search = DigestSearch::new(
            Candidates::new(&prefixes, &space), [digest(wanted).to_ascii_uppercase()]);

        assert_eq!(search.next(), Some(DigestMatch { digest: digest(wanted), version: wanted.to_owned() }));
        assert_eq!(search.matched(), 1);
        assert_eq!(search.outstanding(), 0);
        assert!(search.attempts() < space.len());
        assert_eq!(search.next(), None);
    }

    #[test]
    fn test_search_first_match_wins() {
        let prefixes = prefixes();
        let space = small_space();
        let early = "S916BXXU1AXA2/S916BOXM1AXA2/S916BXXU1AXA2";
        let late = "S916BXXS1AXA2/S916BOXM1AXA2/S916BXXS1AXA2";

        let mut search = DigestSearch::new(
            Candidates::new(&prefixes, &space), [digest(late), digest(early)]);

        assert_eq!(search.next().unwrap().version, early);
        assert_eq!(search.next().unwrap().version, late);
        assert_eq!(search.next(), None);
    }

    #[test]
    fn test_search_exhausted() {
        let prefixes = prefixes();
        let space = small_space();
        let wanted = "S916BXXU1AXA2/S916BOXM1AXA2/S916BXXU1AXA2";

        let mut search = DigestSearch::new(
            Candidates::new(&prefixes, &space), [digest(wanted), digest("unknown")]);

        assert!(search.next().is_some());
        assert_eq!(search.next(), None);
        assert_eq!(search.matched(), 1);
        assert_eq!(search.outstanding(), 1);
        assert_eq!(search.total(), 2);
        assert_eq!(search.attempts(), space.len());
    }

    #[test]
    fn test_digest() {
        assert_eq!(digest(""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
