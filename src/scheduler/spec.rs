use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config::DEFAULT_TASK_INTERVAL_SECS;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CheckBlocks,
    MonitorAddresses,
}

impl FromStr for TaskKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "check_blocks" => Ok(TaskKind::CheckBlocks),
            "monitor_addresses" => Ok(TaskKind::MonitorAddresses),
            other => Err(AppError::Configuration(format!("unknown task kind '{other}'"))),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::CheckBlocks => write!(f, "check_blocks"),
            TaskKind::MonitorAddresses => write!(f, "monitor_addresses"),
        }
    }
}

/// One declared task: `name = kind, interval=5min, if=other`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    pub interval: Duration,
    pub depends_on: Option<String>,
}

pub fn load_task_file(path: impl AsRef<Path>) -> Result<Vec<TaskSpec>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        AppError::Configuration(format!("cannot read task file {}: {e}", path.display()))
    })?;
    parse_task_file(&text)
}

/// Parses task declarations. Lines outside a `[Tasks]` section (once any
/// section header has appeared) are ignored, as are `#` / `;` comments.
pub fn parse_task_file(text: &str) -> Result<Vec<TaskSpec>> {
    let mut specs = Vec::new();
    let mut in_tasks = true;

    for (lineno, raw) in text.lines().enumerate() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            in_tasks = line[1..line.len() - 1].trim().eq_ignore_ascii_case("tasks");
            continue;
        }
        if !in_tasks {
            continue;
        }

        let (name, body) = line.split_once('=').ok_or_else(|| {
            AppError::Configuration(format!("line {}: expected `name = kind, ...`", lineno + 1))
        })?;
        specs.push(parse_entry(name.trim(), body).map_err(|e| match e {
            AppError::Configuration(msg) => AppError::Configuration(format!("line {}: {msg}", lineno + 1)),
            other => other,
        })?);
    }
    Ok(specs)
}

fn strip_comment(line: &str) -> &str {
    match line.find(['#', ';']) {
        Some(i) => &line[..i],
        None => line,
    }
}

fn parse_entry(name: &str, body: &str) -> Result<TaskSpec> {
    if name.is_empty() {
        return Err(AppError::Configuration("task entry has no name".to_string()));
    }
    let mut parts = body.split(',').map(str::trim).filter(|p| !p.is_empty());
    let kind: TaskKind = parts
        .next()
        .ok_or_else(|| AppError::Configuration(format!("task '{name}' has no kind")))?
        .parse()?;

    let mut interval = Duration::from_secs(DEFAULT_TASK_INTERVAL_SECS);
    let mut depends_on = None;
    for part in parts {
        let (key, value) = part.split_once('=').ok_or_else(|| {
            AppError::Configuration(format!("task '{name}': expected key=value, got '{part}'"))
        })?;
        match key.trim() {
            "interval" => interval = parse_interval(value)?,
            "if" => depends_on = Some(value.trim().to_string()),
            other => {
                return Err(AppError::Configuration(format!("task '{name}': unknown option '{other}'")))
            }
        }
    }

    Ok(TaskSpec { name: name.to_string(), kind, interval, depends_on })
}

/// `30s`, `5min`, `5m`, `2h`; a bare number is minutes.
pub fn parse_interval(raw: &str) -> Result<Duration> {
    let raw = raw.trim().to_ascii_lowercase();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let malformed = || AppError::Configuration(format!("malformed interval '{raw}'"));

    let n: u64 = digits.parse().map_err(|_| malformed())?;
    let scale = match unit.trim() {
        "s" | "sec" | "secs" => 1,
        "" | "m" | "min" | "mins" => 60,
        "h" | "hr" | "hour" | "hours" => 3_600,
        _ => return Err(malformed()),
    };
    let secs = n.checked_mul(scale).ok_or_else(malformed)?;
    if secs == 0 {
        return Err(malformed());
    }
    Ok(Duration::from_secs(secs))
}

/// Validates the dependency graph and orders it so every task follows its
/// dependency, keeping declaration order otherwise.
pub fn resolve_order(specs: Vec<TaskSpec>) -> Result<Vec<TaskSpec>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, spec) in specs.iter().enumerate() {
        if index.insert(spec.name.as_str(), i).is_some() {
            return Err(AppError::Configuration(format!("task '{}' declared twice", spec.name)));
        }
    }

    let mut parent: Vec<Option<usize>> = Vec::with_capacity(specs.len());
    for spec in &specs {
        parent.push(match &spec.depends_on {
            None => None,
            Some(dep) => Some(*index.get(dep.as_str()).ok_or_else(|| {
                AppError::Configuration(format!("task '{}' depends on unknown task '{dep}'", spec.name))
            })?),
        });
    }

    // Each task has at most one dependency, so a cycle is a walk that revisits.
    for start in 0..specs.len() {
        let mut steps = 0;
        let mut at = parent[start];
        while let Some(p) = at {
            steps += 1;
            if p == start || steps > specs.len() {
                return Err(AppError::Configuration(format!(
                    "task '{}' is part of a dependency cycle",
                    specs[start].name
                )));
            }
            at = parent[p];
        }
    }

    let mut placed = vec![false; specs.len()];
    let mut order = Vec::with_capacity(specs.len());
    while order.len() < specs.len() {
        let next = (0..specs.len())
            .find(|&i| !placed[i] && parent[i].map_or(true, |p| placed[p]))
            .ok_or_else(|| AppError::Configuration("unresolvable task graph".to_string()))?;
        placed[next] = true;
        order.push(next);
    }

    let mut slots: Vec<Option<TaskSpec>> = specs.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT_CONF: &str = "\
[General]
log_file = agent.log

[Tasks]
# poll the node
task1 = check_blocks, interval=1min
task2 = monitor_addresses, interval=1min, if=task1 ; only when blocks moved
";

    fn spec(name: &str, dep: Option<&str>) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            kind: TaskKind::CheckBlocks,
            interval: Duration::from_secs(60),
            depends_on: dep.map(str::to_string),
        }
    }

    #[test]
    fn parses_agent_style_task_section() {
        let specs = parse_task_file(AGENT_CONF).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "task1");
        assert_eq!(specs[0].kind, TaskKind::CheckBlocks);
        assert_eq!(specs[1].kind, TaskKind::MonitorAddresses);
        assert_eq!(specs[1].interval, Duration::from_secs(60));
        assert_eq!(specs[1].depends_on.as_deref(), Some("task1"));
    }

    #[test]
    fn interval_suffixes() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("5min").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_interval("3").unwrap(), Duration::from_secs(180));
        assert!(parse_interval("soon").is_err());
        assert!(parse_interval("0min").is_err());
        assert!(parse_interval("5 fortnights").is_err());
        assert!(parse_interval("99999999999999999h").is_err());
        assert!(parse_interval("18446744073709551615").is_err());
    }

    #[test]
    fn unknown_kind_and_option_are_rejected() {
        assert!(matches!(parse_task_file("t = mine_blocks"), Err(AppError::Configuration(_))));
        assert!(matches!(
            parse_task_file("t = check_blocks, every=5min"),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn unknown_dependency_is_a_configuration_error() {
        let err = resolve_order(vec![spec("a", Some("ghost"))]).unwrap_err();
        assert!(err.to_string().contains("unknown task 'ghost'"), "{err}");
    }

    #[test]
    fn cycles_are_rejected() {
        let err = resolve_order(vec![spec("a", Some("b")), spec("b", Some("a"))]).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
        assert!(resolve_order(vec![spec("self", Some("self"))]).is_err());
    }

    #[test]
    fn dependents_follow_their_dependency() {
        let ordered = resolve_order(vec![
            spec("monitor", Some("check")),
            spec("other", None),
            spec("check", None),
        ])
        .unwrap();
        let names: Vec<_> = ordered.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["other", "check", "monitor"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        assert!(resolve_order(vec![spec("a", None), spec("a", None)]).is_err());
    }
}
