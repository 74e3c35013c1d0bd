//! Parser for the copilot CLI's plain-text usage summary: the block of
//! lines the agent prints after finishing a turn, reporting a premium
//! request estimate, API/session time, code-change totals, and a
//! per-model token breakdown (§4.8).
//!
//! Grounded on the line-oriented, regex-per-field style of the teacher's
//! comment-prefix parser: build one `Regex` per recognized line shape up
//! front, then try each against every line independently rather than
//! parsing the whole block as a single grammar. Unlike the teacher's
//! parser, matching here also has to first strip off the CLI's leading
//! `[12:46:20 PM] [INFO] [copilot]`-style bracket-prefix groups, and has
//! a stateful "model table" mode entered by a header line.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Token counts for a single model mentioned in a usage summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTokens {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl ModelTokens {
    fn add_assign(&mut self, other: &ModelTokens) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// Everything extracted from one agent's usage summary text. Any field
/// the text didn't mention stays at its default rather than erroring —
/// agents vary in which lines they print.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub premium_requests: Option<f64>,
    pub api_duration_ms: Option<u64>,
    pub session_duration_ms: Option<u64>,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub cost_usd: Option<f64>,
    pub models: BTreeMap<String, ModelTokens>,
}

impl UsageMetrics {
    pub fn merge(&mut self, other: &UsageMetrics) {
        self.premium_requests = match (self.premium_requests, other.premium_requests) {
            (Some(a), Some(b)) => Some(a + b),
            (a, None) => a,
            (None, b) => b,
        };
        self.api_duration_ms = add_opt(self.api_duration_ms, other.api_duration_ms);
        self.session_duration_ms = add_opt(self.session_duration_ms, other.session_duration_ms);
        self.lines_added += other.lines_added;
        self.lines_removed += other.lines_removed;
        self.cost_usd = match (self.cost_usd, other.cost_usd) {
            (Some(a), Some(b)) => Some(a + b),
            (a, None) => a,
            (None, b) => b,
        };
        for (model, tokens) in &other.models {
            self.models.entry(model.clone()).or_default().add_assign(tokens);
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.models
            .values()
            .map(|t| t.input_tokens + t.output_tokens + t.cache_read_tokens + t.cache_write_tokens)
            .sum()
    }
}

fn add_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, None) => a,
        (None, b) => b,
    }
}

// Leading `[...] [...] ...` bracket-prefix groups the copilot CLI stamps
// on every line (timestamp, level, source) before the actual content.
static BRACKET_PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:\s*\[[^\]]*\])+\s*").unwrap());

static PREMIUM_REQUESTS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^Total usage est:\s*([0-9]+(?:\.[0-9]+)?)\s*Premium requests\s*$").unwrap());
static API_TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^API time spent:\s*(.+?)\s*$").unwrap());
static SESSION_TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^Total session time:\s*(.+?)\s*$").unwrap());
static CODE_CHANGES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^Total code changes:\s*\+(\d[\d,]*)\s*-(\d[\d,]*)\s*$").unwrap());
static COST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:total )?cost:?\s*\$?([0-9]+(?:\.[0-9]+)?)\s*$").unwrap());
static MODEL_TABLE_HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^Breakdown by AI model:\s*$").unwrap());
// "gpt-4.1  12.3k in, 4,502 out, 1.1m cached (Est. 2.5 Premium requests)"
static MODEL_ROW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^([\w.\-/]+)\s+([0-9][0-9,.]*\s*[km]?)\s*in,\s*([0-9][0-9,.]*\s*[km]?)\s*out(?:,\s*([0-9][0-9,.]*\s*[km]?)\s*cached)?(?:\s*\(Est\.\s*([0-9]+(?:\.[0-9]+)?)\s*Premium requests\))?\s*$",
    )
    .unwrap()
});

/// Parse a count like `12.3k`, `1.1m`, or `4,502` into a whole number of
/// tokens/requests.
fn parse_count(raw: &str) -> Option<f64> {
    let raw = raw.trim().replace(',', "");
    let (number_part, multiplier) = if let Some(stripped) = raw.strip_suffix(['k', 'K']) {
        (stripped, 1_000.0)
    } else if let Some(stripped) = raw.strip_suffix(['m', 'M']) {
        (stripped, 1_000_000.0)
    } else {
        (raw.as_str(), 1.0)
    };
    number_part.trim().parse::<f64>().ok().map(|n| n * multiplier)
}

fn parse_duration_to_ms(raw: &str) -> Option<u64> {
    // Accepts "3m12s", "45s", "1h2m3s", "90000ms", or a bare number of
    // seconds.
    if let Ok(seconds) = raw.trim().parse::<f64>() {
        return Some((seconds * 1000.0) as u64);
    }
    if let Some(stripped) = raw.strip_suffix("ms") {
        return stripped.trim().parse::<u64>().ok();
    }
    let re = Regex::new(r"(?i)(?:(\d+)h)?\s*(?:(\d+)m)?\s*(?:(\d+(?:\.\d+)?)s)?").ok()?;
    let caps = re.captures(raw.trim())?;
    let hours: u64 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let minutes: u64 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let seconds: f64 = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0.0);
    if hours == 0 && minutes == 0 && seconds == 0.0 {
        return None;
    }
    Some(hours * 3_600_000 + minutes * 60_000 + (seconds * 1000.0) as u64)
}

/// Parse a full usage-summary block per §4.8's copilot grammar.
///
/// Each line first has its bracket-prefix groups stripped. A
/// `Breakdown by AI model:` header switches parsing into model-table
/// mode, where each subsequent line is tried as a model row; the first
/// line that doesn't match a row ends the table (falling back through
/// the ordinary single-line matchers for that line).
pub fn parse_usage_summary(text: &str) -> UsageMetrics {
    let mut metrics = UsageMetrics::default();
    let mut in_model_table = false;

    for raw_line in text.lines() {
        let stripped = BRACKET_PREFIX_RE.replace(raw_line, "");
        let line = stripped.trim();
        if line.is_empty() {
            continue;
        }

        if in_model_table {
            if let Some(caps) = MODEL_ROW_RE.captures(line) {
                let model = caps[1].to_string();
                let mut tokens = ModelTokens::default();
                tokens.input_tokens = parse_count(&caps[2]).unwrap_or(0.0) as u64;
                tokens.output_tokens = parse_count(&caps[3]).unwrap_or(0.0) as u64;
                if let Some(cached) = caps.get(4) {
                    tokens.cache_read_tokens = parse_count(cached.as_str()).unwrap_or(0.0) as u64;
                }
                metrics.models.entry(model).or_default().add_assign(&tokens);
                if let Some(est) = caps.get(5) {
                    if let Ok(n) = est.as_str().parse::<f64>() {
                        metrics.premium_requests = Some(metrics.premium_requests.unwrap_or(0.0) + n);
                    }
                }
                continue;
            }
            in_model_table = false;
        }

        if MODEL_TABLE_HEADER_RE.is_match(line) {
            in_model_table = true;
            continue;
        }

        if let Some(caps) = PREMIUM_REQUESTS_RE.captures(line) {
            if let Ok(n) = caps[1].parse::<f64>() {
                metrics.premium_requests = Some(metrics.premium_requests.unwrap_or(0.0) + n);
            }
            continue;
        }

        if let Some(caps) = API_TIME_RE.captures(line) {
            if let Some(ms) = parse_duration_to_ms(&caps[1]) {
                metrics.api_duration_ms = Some(metrics.api_duration_ms.unwrap_or(0) + ms);
            }
            continue;
        }

        if let Some(caps) = SESSION_TIME_RE.captures(line) {
            if let Some(ms) = parse_duration_to_ms(&caps[1]) {
                metrics.session_duration_ms = Some(metrics.session_duration_ms.unwrap_or(0) + ms);
            }
            continue;
        }

        if let Some(caps) = CODE_CHANGES_RE.captures(line) {
            let added: u64 = caps[1].replace(',', "").parse().unwrap_or(0);
            let removed: u64 = caps[2].replace(',', "").parse().unwrap_or(0);
            metrics.lines_added += added;
            metrics.lines_removed += removed;
            continue;
        }

        if let Some(caps) = COST_RE.captures(line) {
            if let Ok(cost) = caps[1].parse::<f64>() {
                metrics.cost_usd = Some(metrics.cost_usd.unwrap_or(0.0) + cost);
            }
            continue;
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_premium_requests_with_bracket_prefix() {
        let metrics = parse_usage_summary("[12:46:20 PM] [INFO] [copilot] Total usage est: 3 Premium requests\n");
        assert_eq!(metrics.premium_requests, Some(3.0));
    }

    #[test]
    fn parses_code_changes() {
        let metrics = parse_usage_summary("Total code changes: +120 -45\n");
        assert_eq!(metrics.lines_added, 120);
        assert_eq!(metrics.lines_removed, 45);
    }

    #[test]
    fn parses_api_and_session_duration() {
        let metrics = parse_usage_summary("API time spent: 1m30s\nTotal session time: 45s\n");
        assert_eq!(metrics.api_duration_ms, Some(90_000));
        assert_eq!(metrics.session_duration_ms, Some(45_000));
    }

    #[test]
    fn parses_model_breakdown_table_with_suffixes_and_cached() {
        let metrics = parse_usage_summary(
            "Breakdown by AI model:\n\
             gpt-4.1  12.3k in, 4,502 out, 1.1m cached (Est. 2.5 Premium requests)\n\
             claude-sonnet  100 in, 50 out\n",
        );
        let gpt = metrics.models.get("gpt-4.1").expect("gpt-4.1 row parsed");
        assert_eq!(gpt.input_tokens, 12_300);
        assert_eq!(gpt.output_tokens, 4_502);
        assert_eq!(gpt.cache_read_tokens, 1_100_000);

        let claude = metrics.models.get("claude-sonnet").expect("claude-sonnet row parsed");
        assert_eq!(claude.input_tokens, 100);
        assert_eq!(claude.output_tokens, 50);
        assert_eq!(claude.cache_read_tokens, 0);

        assert_eq!(metrics.premium_requests, Some(2.5));
    }

    #[test]
    fn a_non_matching_line_ends_the_model_table() {
        let metrics = parse_usage_summary(
            "Breakdown by AI model:\n\
             gpt-4.1  10 in, 5 out\n\
             Total code changes: +1 -0\n",
        );
        assert_eq!(metrics.models.len(), 1);
        assert_eq!(metrics.lines_added, 1);
    }

    #[test]
    fn ignores_unrecognized_lines() {
        let metrics = parse_usage_summary("this is unrelated chatter\nTotal usage est: 1 Premium requests\n");
        assert_eq!(metrics.premium_requests, Some(1.0));
    }

    #[test]
    fn merge_sums_fields() {
        let mut a = parse_usage_summary("Total usage est: 1 Premium requests\nTotal code changes: +10 -2\n");
        let b = parse_usage_summary("Total usage est: 2 Premium requests\nTotal code changes: +5 -1\n");
        a.merge(&b);
        assert_eq!(a.premium_requests, Some(3.0));
        assert_eq!(a.lines_added, 15);
        assert_eq!(a.lines_removed, 3);
    }

    #[test]
    fn total_tokens_sums_across_models() {
        let metrics = parse_usage_summary(
            "Breakdown by AI model:\n\
             gpt-4.1  100 in, 50 out\n\
             claude-3  20 in, 10 out\n",
        );
        assert_eq!(metrics.total_tokens(), 180);
    }

    #[test]
    fn real_copilot_block_parses_end_to_end() {
        let block = "[12:46:20 PM] [INFO] [copilot] Total usage est: 4.5 Premium requests\n\
                      [12:46:20 PM] [INFO] [copilot] API time spent: 12s\n\
                      [12:46:20 PM] [INFO] [copilot] Total session time: 1m3s\n\
                      [12:46:20 PM] [INFO] [copilot] Total code changes: +42 -7\n\
                      [12:46:20 PM] [INFO] [copilot] Breakdown by AI model:\n\
                      [12:46:20 PM] [INFO] [copilot] gpt-5  8.2k in, 1.3k out, 500 cached (Est. 4.5 Premium requests)\n";
        let metrics = parse_usage_summary(block);
        assert_eq!(metrics.premium_requests, Some(9.0));
        assert_eq!(metrics.api_duration_ms, Some(12_000));
        assert_eq!(metrics.session_duration_ms, Some(63_000));
        assert_eq!(metrics.lines_added, 42);
        assert_eq!(metrics.lines_removed, 7);
        let gpt5 = metrics.models.get("gpt-5").expect("gpt-5 row parsed");
        assert_eq!(gpt5.input_tokens, 8_200);
        assert_eq!(gpt5.output_tokens, 1_300);
        assert_eq!(gpt5.cache_read_tokens, 500);
    }
}
