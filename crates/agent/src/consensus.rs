//! Multi-critic selection and consensus merge.

use std::collections::BTreeMap;

use proto::RunRecord;

use crate::config::{ConsensusConfig, DynamicSelectionConfig, MultiCriticConfig};

const CONSENSUS_HEADER: &str = "=== MULTI-CRITIC CONSENSUS ===";

/// Raw output of one critic.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticFinding {
    pub critic: String,
    pub weight: f32,
    pub text: String,
}

impl CriticFinding {
    pub fn is_high_priority(&self) -> bool {
        self.weight > 1.0
    }
}

/// Merged critic output plus the per-critic runs behind it.
#[derive(Debug, Clone, Default)]
pub struct MultiCriticReport {
    /// Empty when multi-critic review is disabled or no critic answered.
    pub consensus: String,
    pub records: Vec<RunRecord>,
}

impl MultiCriticReport {
    pub fn total_tokens(&self) -> u32 {
        self.records.iter().map(|r| r.total_tokens).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.consensus.is_empty()
    }

    /// Raw answers of the critics that succeeded, one after another.
    ///
    /// Issue extraction reads this instead of the rendered consensus so that
    /// section labels never count as findings.
    pub fn findings_text(&self) -> String {
        self.records
            .iter()
            .filter(|r| !r.is_error())
            .map(|r| r.response.trim())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Critics to run for a builder response.
///
/// With dynamic selection off every configured critic runs. Otherwise critics
/// are scored by how many of their trigger words occur in the prompt and
/// response; the best `max_critics` positive scorers run, padded up to
/// `min_critics` in score order.
pub fn select_critics(
    prompt: &str,
    response: &str,
    multi: &MultiCriticConfig,
    selection: &DynamicSelectionConfig,
) -> Vec<String> {
    if !selection.enabled {
        return multi.critics.clone();
    }

    let haystack = format!("{prompt}\n{response}").to_lowercase();
    let mut ranked: Vec<(usize, &String)> = multi
        .critics
        .iter()
        .map(|critic| {
            let hits = selection.keywords.get(critic).map_or(0, |words| {
                words
                    .iter()
                    .filter(|w| !w.is_empty() && haystack.contains(&w.to_lowercase()))
                    .count()
            });
            (hits, critic)
        })
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));

    if ranked.iter().all(|(hits, _)| *hits == 0) {
        return selection
            .fallback_critics
            .iter()
            .take(selection.max_critics.max(1))
            .cloned()
            .collect();
    }

    let positive = ranked.iter().filter(|(hits, _)| *hits > 0).count();
    let keep = positive
        .max(selection.min_critics)
        .min(selection.max_critics.max(1))
        .min(ranked.len());
    ranked
        .into_iter()
        .take(keep)
        .map(|(_, critic)| critic.clone())
        .collect()
}

/// Builds findings in input order with weights from the consensus table.
pub fn findings_from(results: Vec<(String, String)>, consensus: &ConsensusConfig) -> Vec<CriticFinding> {
    results
        .into_iter()
        .map(|(critic, text)| CriticFinding {
            weight: consensus.weight(&critic),
            critic,
            text,
        })
        .collect()
}

/// Merges critic findings into one report.
///
/// Sections are ordered by weight (ties keep input order) and keep each
/// critic's text verbatim. Lines raised by at least `threshold` critics are
/// repeated in a shared-findings section. No findings yields `""`.
pub fn merge_consensus(findings: &[CriticFinding], threshold: usize) -> String {
    if findings.is_empty() {
        return String::new();
    }

    let mut ordered: Vec<&CriticFinding> = findings.iter().collect();
    ordered.sort_by(|a, b| b.weight.total_cmp(&a.weight));

    let mut out = String::from(CONSENSUS_HEADER);
    out.push_str(&format!(
        "\nCritics: {} | Shared-finding threshold: {}\n",
        findings.len(),
        threshold
    ));

    for finding in &ordered {
        let label = finding.critic.to_uppercase();
        if finding.is_high_priority() {
            out.push_str(&format!(
                "\n[{label}] ⚠️ HIGH PRIORITY (weight {:.1})\n",
                finding.weight
            ));
        } else {
            out.push_str(&format!("\n[{label}] (weight {:.1})\n", finding.weight));
        }
        let body = finding.text.trim();
        if body.is_empty() {
            out.push_str("[No findings]\n");
        } else {
            out.push_str(body);
            out.push('\n');
        }
    }

    let shared = shared_findings(&ordered, threshold.max(2));
    if !shared.is_empty() {
        out.push_str(&format!(
            "\n--- Shared findings (raised by {}+ critics) ---\n",
            threshold.max(2)
        ));
        for (line, critics) in shared {
            out.push_str(&format!("- {line} ({})\n", critics.join(", ")));
        }
    }

    out.trim_end().to_string()
}

/// Lines that at least `threshold` distinct critics raised, in first-seen order.
fn shared_findings(findings: &[&CriticFinding], threshold: usize) -> Vec<(String, Vec<String>)> {
    let mut seen: BTreeMap<String, (usize, String, Vec<String>)> = BTreeMap::new();
    let mut order = 0;
    for finding in findings {
        for line in finding.text.lines() {
            let display = line
                .trim()
                .trim_start_matches(['-', '*', '•'])
                .trim()
                .to_string();
            if display.is_empty() {
                continue;
            }
            let key = display.to_lowercase();
            let entry = seen.entry(key).or_insert_with(|| {
                order += 1;
                (order, display.clone(), Vec::new())
            });
            if !entry.2.contains(&finding.critic) {
                entry.2.push(finding.critic.clone());
            }
        }
    }

    let mut shared: Vec<(usize, String, Vec<String>)> = seen
        .into_values()
        .filter(|(_, _, critics)| critics.len() >= threshold)
        .collect();
    shared.sort_by_key(|(order, _, _)| *order);
    shared
        .into_iter()
        .map(|(_, line, critics)| (line, critics))
        .collect()
}
