//! Aggregates per-file domain labels into a recommended domain hierarchy.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::{DomainConfig, DomainRecommendation, DomainRecommendations, FileAnalysis};

const REPRESENTATIVE_FILES: usize = 3;

/// Split a raw label into normalized path segments.
///
/// `" UI / Main Display "` becomes `["ui", "main-display"]`. Returns `None`
/// for labels with no usable segment.
pub fn normalize_label(raw: &str) -> Option<Vec<String>> {
    let segments: Vec<String> = raw
        .split('/')
        .map(|s| {
            s.trim()
                .to_lowercase()
                .split(|c: char| c.is_whitespace() || c == '_')
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
                .join("-")
        })
        .filter(|s| !s.is_empty())
        .collect();
    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

/// Domain id for a normalized label: segments joined with `-`.
pub fn label_id(segments: &[String]) -> String {
    segments.join("-")
}

/// Files grouped by the full domain id they report. Unlabelled files are left out.
pub fn group_by_domain(results: &BTreeMap<String, FileAnalysis>) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (path, analysis) in results {
        if let Some(segments) = analysis.domain.as_deref().and_then(normalize_label) {
            groups.entry(label_id(&segments)).or_default().push(path.clone());
        }
    }
    groups
}

#[derive(Default)]
struct Candidate<'a> {
    last_segment: String,
    files: BTreeSet<&'a str>,
    spellings: HashMap<String, usize>,
    subdomains: BTreeSet<String>,
}

impl Candidate<'_> {
    /// Share of files that spelled this prefix the same way.
    fn agreement(&self) -> (usize, &str) {
        self.spellings
            .iter()
            .map(|(spelling, count)| (*count, spelling.as_str()))
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)))
            .unwrap_or((0, ""))
    }
}

fn title_case(segment: &str) -> String {
    segment
        .split('-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build recommendations from the cached analyses and diff them against `current`.
pub fn recommend(results: &BTreeMap<String, FileAnalysis>, current: &[DomainConfig]) -> DomainRecommendations {
    let mut candidates: BTreeMap<String, Candidate> = BTreeMap::new();

    for (path, analysis) in results {
        let Some(raw) = analysis.domain.as_deref() else {
            continue;
        };
        let Some(segments) = normalize_label(raw) else {
            continue;
        };
        let raw_segments: Vec<&str> = raw.split('/').map(str::trim).filter(|s| !s.is_empty()).collect();

        for depth in 1..=segments.len() {
            let id = label_id(&segments[..depth]);
            let spelling = raw_segments[..depth.min(raw_segments.len())].join("/");
            let candidate = candidates.entry(id).or_default();
            candidate.last_segment = segments[depth - 1].clone();
            candidate.files.insert(path.as_str());
            *candidate.spellings.entry(spelling).or_insert(0) += 1;
            if depth < segments.len() {
                candidate.subdomains.insert(label_id(&segments[..=depth]));
            }
        }
    }

    let existing: HashMap<&str, &DomainConfig> = current.iter().map(|d| (d.id.as_str(), d)).collect();

    let mut recommendations: Vec<DomainRecommendation> = candidates
        .iter()
        .map(|(id, candidate)| {
            let n = candidate.files.len();
            let (agreeing, spelling) = candidate.agreement();
            let agreement = agreeing as f64 / n as f64;
            let confidence = (agreement * n as f64 / (n as f64 + 1.0)).clamp(0.0, 1.0);

            let representative: Vec<(&str, &str)> = candidate
                .files
                .iter()
                .filter_map(|p| {
                    let purpose = results.get(*p)?.purpose.trim();
                    (!purpose.is_empty()).then_some((*p, purpose))
                })
                .take(REPRESENTATIVE_FILES)
                .collect();

            let known = existing.get(id.as_str());
            let name = known
                .map(|d| d.name.clone())
                .unwrap_or_else(|| title_case(&candidate.last_segment));
            let description = known
                .map(|d| d.description.clone())
                .filter(|d| !d.is_empty())
                .or_else(|| representative.first().map(|(_, purpose)| purpose.to_string()))
                .unwrap_or_default();

            let mut reasoning = format!(
                "{} file{} classified as '{}'; {} of {} use the label '{}'.",
                n,
                if n == 1 { "" } else { "s" },
                id,
                agreeing,
                n,
                spelling
            );
            if !candidate.subdomains.is_empty() {
                let subs: Vec<&str> = candidate.subdomains.iter().map(String::as_str).collect();
                reasoning.push_str(&format!(" Subdomains: {}.", subs.join(", ")));
            }
            if !representative.is_empty() {
                let examples: Vec<String> = representative
                    .iter()
                    .map(|(path, purpose)| format!("{}: {}", path, purpose))
                    .collect();
                reasoning.push_str(&format!(" Representative files: {}.", examples.join("; ")));
            }

            DomainRecommendation {
                domain_id: id.clone(),
                name,
                description,
                subdomain_ids: candidate.subdomains.iter().cloned().collect(),
                confidence,
                matching_files: candidate.files.iter().map(|p| p.to_string()).collect(),
                reasoning,
            }
        })
        .collect();

    recommendations.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.domain_id.cmp(&b.domain_id))
    });

    let changes_detected = diff(&recommendations, current);
    debug!(
        "recommended {} domains from {} analyses (changes: {})",
        recommendations.len(),
        results.len(),
        changes_detected
    );
    DomainRecommendations {
        recommendations,
        changes_detected,
    }
}

/// True iff some recommended id is not configured, or a configured domain's
/// subdomain set differs from the recommended one.
pub fn diff(recommendations: &[DomainRecommendation], current: &[DomainConfig]) -> bool {
    let existing: HashMap<&str, &DomainConfig> = current.iter().map(|d| (d.id.as_str(), d)).collect();
    recommendations.iter().any(|rec| match existing.get(rec.domain_id.as_str()) {
        None => true,
        Some(config) => {
            let configured: BTreeSet<&str> = config.subdomain_ids.iter().map(String::as_str).collect();
            let recommended: BTreeSet<&str> = rec.subdomain_ids.iter().map(String::as_str).collect();
            configured != recommended
        }
    })
}

/// Merge recommendations into the current configuration.
///
/// Configured domains keep their position, name and description; recommended
/// subdomains are appended. Unknown ids are added after them.
pub fn apply(current: &[DomainConfig], recommendations: &[DomainRecommendation]) -> Vec<DomainConfig> {
    let mut merged: Vec<DomainConfig> = current.to_vec();
    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, d)| (d.id.clone(), i))
        .collect();

    for rec in recommendations {
        match index.get(&rec.domain_id) {
            Some(&i) => {
                let config = &mut merged[i];
                if config.description.is_empty() {
                    config.description = rec.description.clone();
                }
                for sub in &rec.subdomain_ids {
                    if !config.subdomain_ids.contains(sub) {
                        config.subdomain_ids.push(sub.clone());
                    }
                }
            }
            None => {
                index.insert(rec.domain_id.clone(), merged.len());
                merged.push(DomainConfig {
                    id: rec.domain_id.clone(),
                    name: rec.name.clone(),
                    description: rec.description.clone(),
                    subdomain_ids: rec.subdomain_ids.clone(),
                });
            }
        }
    }
    merged
}

/// Domain id that occurs in `path`, case-insensitively. The longest id wins;
/// ties go to the lexicographically smaller id.
pub fn infer_from_path<'a, I>(path: &str, domain_ids: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let path = path.to_lowercase();
    domain_ids
        .into_iter()
        .filter(|id| !id.is_empty() && path.contains(&id.to_lowercase()))
        .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
        .map(str::to_string)
}
