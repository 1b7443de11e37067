use chrono::{DateTime, NaiveDateTime};
use runlens_core::{RunSnapshot, RunStatus, Step, TimelineStats};

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Backend timestamps come with or without a `T`, fraction or offset.
/// Unparseable values are shown as-is.
pub fn format_timestamp(raw: &str) -> String {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string();
    }
    for format in TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return parsed.format("%Y-%m-%d %H:%M:%S").to_string();
        }
    }
    raw.to_string()
}

pub fn format_latency(latency_ms: Option<f64>) -> String {
    match latency_ms.filter(|value| value.is_finite()) {
        Some(value) if value >= 1_000.0 => format!("{:.2} s", value / 1_000.0),
        Some(value) => format!("{value:.0} ms"),
        None => "-".to_string(),
    }
}

pub fn format_cost(cost_usd: Option<f64>) -> String {
    match cost_usd.filter(|value| value.is_finite()) {
        Some(value) => format!("${value:.4}"),
        None => "-".to_string(),
    }
}

pub fn ellipsize(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    if max <= 3 {
        return "...".chars().take(max).collect();
    }
    let prefix: String = input.chars().take(max - 3).collect();
    format!("{prefix}...")
}

pub fn fit_fields(fields: &[String], max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    let mut output = String::new();
    for field in fields {
        if field.trim().is_empty() {
            continue;
        }
        let candidate = if output.is_empty() {
            field.clone()
        } else {
            format!("{output} | {field}")
        };
        if candidate.chars().count() <= max {
            output = candidate;
            continue;
        }
        if output.is_empty() {
            return ellipsize(field, max);
        }
        break;
    }
    output
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn format_step_line(step: &Step) -> String {
    let mut line = format!(
        "#{:<5} {:<19} {:<12} {:<24} {:>9} {:>9}",
        step.id,
        step.created_at
            .as_deref()
            .map(format_timestamp)
            .unwrap_or_else(|| "-".to_string()),
        ellipsize(&step.step_type, 12),
        ellipsize(step.display_name(), 24),
        format_latency(step.latency_ms),
        format_cost(step.cost_usd),
    );
    if let Some(tokens) = step.tokens {
        line.push_str(&format!(" {tokens} tok"));
    }
    if let Some(error) = step.error_message.as_deref() {
        line.push_str(&format!(" ! {}", single_line(error)));
    }
    line
}

pub fn format_run_row(run: &RunSnapshot) -> String {
    format!(
        "#{:<6} {:<9} {:<18} {:>8} {:>10} {:<19} {}",
        run.id.get(),
        run.status.as_str(),
        ellipsize(run.agent_name.as_deref().unwrap_or("-"), 18),
        run.total_tokens
            .map(|tokens| tokens.to_string())
            .unwrap_or_else(|| "-".to_string()),
        format_cost(run.total_cost_usd),
        run.created_at
            .as_deref()
            .map(format_timestamp)
            .unwrap_or_else(|| "-".to_string()),
        ellipsize(&single_line(run.input_prompt.as_deref().unwrap_or("")), 48),
    )
}

pub fn format_stats(stats: &TimelineStats) -> String {
    let types = stats
        .type_counts()
        .iter()
        .map(|(step_type, count)| format!("{step_type}={count}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "steps={} avg={} max={}{}{}",
        stats.count,
        format_latency(stats.mean_latency_ms),
        format_latency(stats.max_latency_ms),
        if types.is_empty() { "" } else { " " },
        types
    )
}

pub fn format_eval(run: &RunSnapshot) -> String {
    match run.eval_provider.as_deref() {
        None => "not evaluated".to_string(),
        Some(provider) => {
            let scores = run
                .eval_scores
                .as_ref()
                .map(|scores| scores.to_string())
                .unwrap_or_else(|| "-".to_string());
            format!(
                "{provider} ({}) scores={}",
                run.eval_status.as_deref().unwrap_or("pending"),
                ellipsize(&scores, 120)
            )
        }
    }
}

/// Client-side list filter: optional status plus id/agent/prompt search.
pub fn filter_runs(
    runs: Vec<RunSnapshot>,
    status: Option<RunStatus>,
    query: Option<&str>,
) -> Vec<RunSnapshot> {
    runs.into_iter()
        .filter(|run| status.map_or(true, |status| run.status == status))
        .filter(|run| query.map_or(true, |query| run.matches_query(query)))
        .collect()
}
