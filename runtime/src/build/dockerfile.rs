//! Dockerfile parser.
//!
//! Parses a Dockerfile into a sequence of build steps. Supports line
//! continuations (`\`), comments, shell and JSON (exec) forms, and
//! `$VAR` / `${VAR}` substitution from build args and `ENV`.

use std::collections::BTreeMap;
use std::fmt;

use dockling_core::error::{DocklingError, Result};

/// Shell or exec form of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandForm {
    /// `RUN make all`, run through `/bin/sh -c`
    Shell(String),
    /// `RUN ["make", "all"]`, run directly
    Exec(Vec<String>),
}

impl CommandForm {
    /// Argument vector to execute.
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandForm::Shell(command) => shell_argv(command),
            CommandForm::Exec(argv) => argv.clone(),
        }
    }
}

/// A single Dockerfile instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `FROM <image> [AS <name>]`
    From { image: String, alias: Option<String> },
    /// `RUN <command>`
    Run { command: CommandForm },
    /// `COPY [--from=<stage>] <src>... <dest>` (also `ADD` for local sources)
    Copy {
        sources: Vec<String>,
        dest: String,
        from: Option<String>,
    },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `ENV <key>=<value> ...` or `ENV <key> <value>`
    Env { vars: Vec<(String, String)> },
    /// `ENTRYPOINT`, exec form or shell form wrapped in `/bin/sh -c`
    Entrypoint { exec: Vec<String> },
    /// `CMD`, exec form or shell form wrapped in `/bin/sh -c`
    Cmd { exec: Vec<String> },
    /// `EXPOSE <port>[/<proto>] ...`
    Expose { ports: Vec<String> },
    /// `LABEL <key>=<value> ...`
    Label { labels: Vec<(String, String)> },
    /// `USER <user>[:<group>]`
    User { user: String },
    /// `ARG <name>[=<default>]`
    Arg { name: String, default: Option<String> },
}

impl Instruction {
    /// Instructions that produce a filesystem layer.
    pub fn produces_layer(&self) -> bool {
        matches!(
            self,
            Instruction::Run { .. } | Instruction::Copy { .. } | Instruction::Workdir { .. }
        )
    }

    /// Substitute known variables. Unknown variables are left untouched;
    /// `ENTRYPOINT`/`CMD` are never expanded.
    pub fn expand(&self, vars: &BTreeMap<String, String>) -> Instruction {
        let x = |s: &str| expand_vars(s, vars, false);
        match self {
            Instruction::From { image, alias } => Instruction::From {
                image: x(image),
                alias: alias.clone(),
            },
            Instruction::Run { command } => Instruction::Run {
                command: match command {
                    CommandForm::Shell(s) => CommandForm::Shell(expand_vars(s, vars, true)),
                    CommandForm::Exec(argv) => {
                        CommandForm::Exec(argv.iter().map(|a| expand_vars(a, vars, true)).collect())
                    }
                },
            },
            Instruction::Copy {
                sources,
                dest,
                from,
            } => Instruction::Copy {
                sources: sources.iter().map(|s| x(s)).collect(),
                dest: x(dest),
                from: from.as_deref().map(x),
            },
            Instruction::Workdir { path } => Instruction::Workdir { path: x(path) },
            Instruction::Env { vars: pairs } => Instruction::Env {
                vars: pairs.iter().map(|(k, v)| (k.clone(), x(v))).collect(),
            },
            Instruction::Expose { ports } => Instruction::Expose {
                ports: ports.iter().map(|p| x(p)).collect(),
            },
            Instruction::Label { labels } => Instruction::Label {
                labels: labels.iter().map(|(k, v)| (x(k), x(v))).collect(),
            },
            Instruction::User { user } => Instruction::User { user: x(user) },
            Instruction::Arg { name, default } => Instruction::Arg {
                name: name.clone(),
                default: default.as_deref().map(x),
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for Instruction {
    /// Canonical text, used for history entries and cache keys.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From { image, alias } => match alias {
                Some(alias) => write!(f, "FROM {} AS {}", image, alias),
                None => write!(f, "FROM {}", image),
            },
            Instruction::Run { command } => match command {
                CommandForm::Shell(s) => write!(f, "RUN {}", s),
                CommandForm::Exec(argv) => write!(f, "RUN {}", json_array(argv)),
            },
            Instruction::Copy {
                sources,
                dest,
                from,
            } => {
                write!(f, "COPY ")?;
                if let Some(from) = from {
                    write!(f, "--from={} ", from)?;
                }
                write!(f, "{} {}", sources.join(" "), dest)
            }
            Instruction::Workdir { path } => write!(f, "WORKDIR {}", path),
            Instruction::Env { vars } => write!(f, "ENV {}", pairs(vars)),
            Instruction::Entrypoint { exec } => write!(f, "ENTRYPOINT {}", json_array(exec)),
            Instruction::Cmd { exec } => write!(f, "CMD {}", json_array(exec)),
            Instruction::Expose { ports } => write!(f, "EXPOSE {}", ports.join(" ")),
            Instruction::Label { labels } => write!(f, "LABEL {}", pairs(labels)),
            Instruction::User { user } => write!(f, "USER {}", user),
            Instruction::Arg { name, default } => match default {
                Some(d) => write!(f, "ARG {}={}", name, d),
                None => write!(f, "ARG {}", name),
            },
        }
    }
}

fn json_array(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_default()
}

fn pairs(items: &[(String, String)]) -> String {
    items
        .iter()
        .map(|(k, v)| {
            if v.is_empty() || v.contains(char::is_whitespace) || v.contains('"') {
                format!("{}={}", k, serde_json::to_string(v).unwrap_or_default())
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// An instruction with the source line it started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub line: usize,
    pub instruction: Instruction,
}

/// Parsed Dockerfile.
#[derive(Debug, Clone)]
pub struct Dockerfile {
    pub steps: Vec<Step>,
}

impl Dockerfile {
    /// Parse a Dockerfile from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut steps = Vec::new();

        for (line, text) in join_continuation_lines(content) {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let instruction = parse_instruction(trimmed, line)?;
            steps.push(Step { line, instruction });
        }

        if steps.is_empty() {
            return Err(DocklingError::RecipeError(
                "Dockerfile is empty or contains no instructions".to_string(),
            ));
        }

        let first = steps
            .iter()
            .find(|s| !matches!(s.instruction, Instruction::Arg { .. }));
        if !matches!(
            first.map(|s| &s.instruction),
            Some(Instruction::From { .. })
        ) {
            return Err(DocklingError::RecipeError(
                "First instruction must be FROM (or ARG before FROM)".to_string(),
            ));
        }

        Ok(Dockerfile { steps })
    }

    /// Parse a Dockerfile from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DocklingError::RecipeError(format!(
                "Failed to read Dockerfile at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }
}

/// Join lines ending with `\` into logical lines, tagged with their first
/// physical line number. Comment lines inside a continuation are dropped.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        } else if line.trim_start().starts_with('#') {
            continue;
        }

        match line.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(line);
                logical.push((start, std::mem::take(&mut current)));
            }
        }
    }

    if !current.trim().is_empty() {
        logical.push((start, current));
    }
    logical
}

fn parse_instruction(line: &str, line_num: usize) -> Result<Instruction> {
    let (keyword, rest) = split_first_word(line);
    let keyword_upper = keyword.to_uppercase();

    match keyword_upper.as_str() {
        "FROM" => parse_from(rest, line_num),
        "RUN" => parse_run(rest, line_num),
        "COPY" => parse_copy(rest, line_num, "COPY"),
        "ADD" => parse_copy(rest, line_num, "ADD"),
        "WORKDIR" => parse_workdir(rest, line_num),
        "ENV" => parse_env(rest, line_num),
        "ENTRYPOINT" => parse_exec(rest, line_num, "ENTRYPOINT")
            .map(|exec| Instruction::Entrypoint { exec }),
        "CMD" => parse_exec(rest, line_num, "CMD").map(|exec| Instruction::Cmd { exec }),
        "EXPOSE" => parse_expose(rest, line_num),
        "LABEL" => parse_label(rest, line_num),
        "USER" => parse_user(rest, line_num),
        "ARG" => parse_arg(rest, line_num),
        _ => Err(DocklingError::RecipeError(format!(
            "line {}: unknown instruction '{}'",
            line_num, keyword
        ))),
    }
}

fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn missing(line_num: usize, what: &str) -> DocklingError {
    DocklingError::RecipeError(format!("line {}: {}", line_num, what))
}

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    match parts.as_slice() {
        [image] => Ok(Instruction::From {
            image: image.to_string(),
            alias: None,
        }),
        [image, as_kw, alias] if as_kw.eq_ignore_ascii_case("AS") => Ok(Instruction::From {
            image: image.to_string(),
            alias: Some(alias.to_ascii_lowercase()),
        }),
        [] => Err(missing(line_num, "FROM requires an image argument")),
        _ => Err(missing(line_num, "FROM expects '<image> [AS <name>]'")),
    }
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing(line_num, "RUN requires a command"));
    }
    let command = if rest.starts_with('[') {
        CommandForm::Exec(parse_json_array(rest, line_num)?)
    } else {
        CommandForm::Shell(rest.to_string())
    };
    Ok(Instruction::Run { command })
}

fn parse_copy(rest: &str, line_num: usize, keyword: &str) -> Result<Instruction> {
    let mut from = None;
    let mut remaining = rest;
    while remaining.starts_with("--") {
        let (flag, after) = split_first_word(remaining);
        if let Some(stage) = flag.strip_prefix("--from=") {
            from = Some(stage.to_ascii_lowercase());
        } else if flag.starts_with("--chown=") || flag.starts_with("--chmod=") {
            tracing::debug!(line = line_num, flag, "Ignoring ownership flag");
        } else {
            return Err(DocklingError::RecipeError(format!(
                "line {}: unsupported {} flag '{}'",
                line_num, keyword, flag
            )));
        }
        remaining = after;
    }

    let mut parts = if remaining.starts_with('[') {
        parse_json_array(remaining, line_num)?
    } else {
        split_words(remaining, line_num)?
    };
    if parts.len() < 2 {
        return Err(missing(
            line_num,
            &format!("{} requires at least one source and a destination", keyword),
        ));
    }

    if keyword == "ADD" {
        if let Some(url) = parts.iter().find(|p| p.contains("://")) {
            return Err(DocklingError::RecipeError(format!(
                "line {}: ADD from remote URL '{}' is not supported",
                line_num, url
            )));
        }
    }

    let dest = parts.pop().unwrap_or_default();
    Ok(Instruction::Copy {
        sources: parts,
        dest,
        from,
    })
}

fn parse_workdir(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing(line_num, "WORKDIR requires a path"));
    }
    Ok(Instruction::Workdir {
        path: rest.to_string(),
    })
}

fn parse_env(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing(line_num, "ENV requires a key and value"));
    }

    let (first, tail) = split_first_word(rest);
    if !first.contains('=') {
        // Legacy form: ENV KEY VALUE
        if tail.is_empty() {
            return Err(missing(line_num, "ENV requires a value"));
        }
        return Ok(Instruction::Env {
            vars: vec![(first.to_string(), unquote(tail))],
        });
    }

    Ok(Instruction::Env {
        vars: parse_pairs(rest, line_num, "ENV")?,
    })
}

fn parse_exec(rest: &str, line_num: usize, keyword: &str) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(missing(line_num, &format!("{} requires an argument", keyword)));
    }
    if rest.starts_with('[') {
        parse_json_array(rest, line_num)
    } else {
        Ok(shell_argv(rest))
    }
}

fn parse_expose(rest: &str, line_num: usize) -> Result<Instruction> {
    let ports: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
    if ports.is_empty() {
        return Err(missing(line_num, "EXPOSE requires a port"));
    }
    for port in &ports {
        let number = port.split('/').next().unwrap_or_default();
        if !number.starts_with('$') && number.parse::<u16>().is_err() {
            return Err(DocklingError::RecipeError(format!(
                "line {}: invalid port '{}'",
                line_num, port
            )));
        }
    }
    Ok(Instruction::Expose { ports })
}

fn parse_label(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing(line_num, "LABEL requires key=value"));
    }
    let (first, tail) = split_first_word(rest);
    if !first.contains('=') {
        return Ok(Instruction::Label {
            labels: vec![(unquote(first), unquote(tail))],
        });
    }
    Ok(Instruction::Label {
        labels: parse_pairs(rest, line_num, "LABEL")?,
    })
}

fn parse_user(rest: &str, line_num: usize) -> Result<Instruction> {
    match rest.split_whitespace().next() {
        Some(user) => Ok(Instruction::User {
            user: user.to_string(),
        }),
        None => Err(missing(line_num, "USER requires a username")),
    }
}

fn parse_arg(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing(line_num, "ARG requires a name"));
    }
    match rest.split_once('=') {
        Some((name, default)) => Ok(Instruction::Arg {
            name: name.trim().to_string(),
            default: Some(unquote(default)),
        }),
        None => Ok(Instruction::Arg {
            name: rest.trim().to_string(),
            default: None,
        }),
    }
}

// --- Helpers ---

fn shell_argv(command: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()]
}

fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| {
        DocklingError::RecipeError(format!(
            "line {}: invalid JSON array '{}': {}",
            line_num, s, e
        ))
    })
}

fn parse_pairs(rest: &str, line_num: usize, keyword: &str) -> Result<Vec<(String, String)>> {
    split_words(rest, line_num)?
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(DocklingError::RecipeError(format!(
                "line {}: {} expects key=value pairs, got '{}'",
                line_num, keyword, word
            ))),
        })
        .collect()
}

/// Split on whitespace, honouring single/double quotes and backslash escapes.
/// Quotes are removed from the resulting words.
fn split_words(s: &str, line_num: usize) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(DocklingError::RecipeError(format!(
            "line {}: unterminated quote",
            line_num
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Substitute `$NAME`, `${NAME}`, `${NAME:-default}` and `${NAME:+alt}`.
///
/// Names absent from `vars` are left as written (except `:-`/`:+` forms).
/// `\$` yields a literal `$`, or stays escaped when `keep_escapes` is set
/// (shell commands do their own unescaping).
pub fn expand_vars(s: &str, vars: &BTreeMap<String, String>, keep_escapes: bool) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && chars.get(i + 1) == Some(&'$') {
            if keep_escapes {
                out.push('\\');
            }
            out.push('$');
            i += 2;
            continue;
        }
        if c != '$' {
            out.push(c);
            i += 1;
            continue;
        }

        if chars.get(i + 1) == Some(&'{') {
            let Some(close) = chars[i + 2..].iter().position(|&c| c == '}') else {
                out.extend(&chars[i..]);
                break;
            };
            let body: String = chars[i + 2..i + 2 + close].iter().collect();
            let original: String = chars[i..i + 3 + close].iter().collect();
            i += 3 + close;

            if let Some((name, default)) = body.split_once(":-") {
                match vars.get(name).filter(|v| !v.is_empty()) {
                    Some(v) => out.push_str(v),
                    None => out.push_str(default),
                }
            } else if let Some((name, alt)) = body.split_once(":+") {
                if vars.get(name).is_some_and(|v| !v.is_empty()) {
                    out.push_str(alt);
                }
            } else {
                match vars.get(&body) {
                    Some(v) => out.push_str(v),
                    None => out.push_str(&original),
                }
            }
            continue;
        }

        let start = i + 1;
        let mut end = start;
        while end < chars.len()
            && (chars[end] == '_'
                || (chars[end].is_ascii_alphanumeric()
                    && (end > start || !chars[end].is_ascii_digit())))
        {
            end += 1;
        }
        if end == start {
            out.push('$');
            i += 1;
            continue;
        }
        let name: String = chars[start..end].iter().collect();
        match vars.get(&name) {
            Some(v) => out.push_str(v),
            None => {
                out.push('$');
                out.push_str(&name);
            }
        }
        i = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only(content: &str) -> Instruction {
        let df = Dockerfile::parse(&format!("FROM scratch\n{}", content)).unwrap();
        df.steps[1].instruction.clone()
    }

    #[test]
    fn test_join_continuation_tracks_line_numbers() {
        let lines = join_continuation_lines("FROM a\nRUN one \\\n  two\n\nCMD x");
        assert_eq!(lines[0], (1, "FROM a".to_string()));
        assert_eq!(lines[1].0, 2);
        assert_eq!(lines[1].1, "RUN one   two");
        assert_eq!(lines[3], (5, "CMD x".to_string()));
    }

    #[test]
    fn test_continuation_skips_interleaved_comments() {
        let df = Dockerfile::parse("FROM a\nRUN apt-get update && \\\n# note\n    apt-get install -y curl\n").unwrap();
        assert_eq!(
            df.steps[1].instruction,
            Instruction::Run {
                command: CommandForm::Shell("apt-get update &&     apt-get install -y curl".to_string())
            }
        );
    }

    #[test]
    fn test_parse_from_with_alias() {
        let df = Dockerfile::parse("FROM golang:1.22 AS Builder").unwrap();
        assert_eq!(
            df.steps[0].instruction,
            Instruction::From {
                image: "golang:1.22".to_string(),
                alias: Some("builder".to_string())
            }
        );
    }

    #[test]
    fn test_parse_run_forms() {
        assert_eq!(
            only("RUN make all"),
            Instruction::Run {
                command: CommandForm::Shell("make all".to_string())
            }
        );
        let exec = only(r#"RUN ["make", "all"]"#);
        assert_eq!(
            exec,
            Instruction::Run {
                command: CommandForm::Exec(vec!["make".to_string(), "all".to_string()])
            }
        );
        assert_eq!(exec.to_string(), r#"RUN ["make","all"]"#);
    }

    #[test]
    fn test_parse_copy_from_stage_and_multiple_sources() {
        assert_eq!(
            only("COPY --from=builder --chown=app:app /out/a /out/b /usr/bin/"),
            Instruction::Copy {
                sources: vec!["/out/a".to_string(), "/out/b".to_string()],
                dest: "/usr/bin/".to_string(),
                from: Some("builder".to_string()),
            }
        );
    }

    #[test]
    fn test_add_is_copy_but_rejects_urls() {
        assert!(matches!(only("ADD app.tar /opt/"), Instruction::Copy { .. }));
        assert!(Dockerfile::parse("FROM a\nADD https://x.io/f /f").is_err());
    }

    #[test]
    fn test_parse_copy_requires_destination() {
        let err = Dockerfile::parse("FROM a\nCOPY only").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parse_env_forms() {
        assert_eq!(
            only(r#"ENV APP_HOME=/app GREETING="hello world""#),
            Instruction::Env {
                vars: vec![
                    ("APP_HOME".to_string(), "/app".to_string()),
                    ("GREETING".to_string(), "hello world".to_string())
                ]
            }
        );
        assert_eq!(
            only("ENV PATH /usr/local/bin:/usr/bin"),
            Instruction::Env {
                vars: vec![("PATH".to_string(), "/usr/local/bin:/usr/bin".to_string())]
            }
        );
    }

    #[test]
    fn test_parse_cmd_and_entrypoint() {
        assert_eq!(
            only(r#"CMD ["nginx", "-g", "daemon off;"]"#),
            Instruction::Cmd {
                exec: vec!["nginx".into(), "-g".into(), "daemon off;".into()]
            }
        );
        assert_eq!(
            only("ENTRYPOINT python app.py"),
            Instruction::Entrypoint {
                exec: vec!["/bin/sh".into(), "-c".into(), "python app.py".into()]
            }
        );
    }

    #[test]
    fn test_parse_expose_label_user_arg() {
        assert_eq!(
            only("EXPOSE 80 443/tcp"),
            Instruction::Expose {
                ports: vec!["80".into(), "443/tcp".into()]
            }
        );
        assert!(Dockerfile::parse("FROM a\nEXPOSE http").is_err());
        assert_eq!(
            only(r#"LABEL version="1.0" maintainer=ops"#),
            Instruction::Label {
                labels: vec![
                    ("version".into(), "1.0".into()),
                    ("maintainer".into(), "ops".into())
                ]
            }
        );
        assert_eq!(only("USER app:app"), Instruction::User { user: "app:app".into() });
        assert_eq!(
            only("ARG VERSION=1.2"),
            Instruction::Arg {
                name: "VERSION".into(),
                default: Some("1.2".into())
            }
        );
    }

    #[test]
    fn test_unknown_instruction_reports_line() {
        let err = Dockerfile::parse("FROM a\n\nHEALTHCHECK CMD true").unwrap_err();
        assert!(matches!(err, DocklingError::RecipeError(_)));
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_first_instruction_must_be_from() {
        assert!(Dockerfile::parse("RUN echo hi").is_err());
        assert!(Dockerfile::parse("").is_err());
        assert!(Dockerfile::parse("ARG BASE=alpine\nFROM $BASE").is_ok());
    }

    #[test]
    fn test_unterminated_quote() {
        assert!(Dockerfile::parse("FROM a\nENV A=\"oops").is_err());
    }

    #[test]
    fn test_expand_vars() {
        let mut vars = BTreeMap::new();
        vars.insert("NAME".to_string(), "app".to_string());
        vars.insert("EMPTY".to_string(), String::new());

        assert_eq!(expand_vars("/opt/$NAME/bin", &vars, false), "/opt/app/bin");
        assert_eq!(expand_vars("${NAME}_v2", &vars, false), "app_v2");
        assert_eq!(expand_vars("${EMPTY:-fallback}", &vars, false), "fallback");
        assert_eq!(expand_vars("${NAME:+set}", &vars, false), "set");
        assert_eq!(expand_vars("$UNKNOWN ${OTHER}", &vars, false), "$UNKNOWN ${OTHER}");
        assert_eq!(expand_vars(r"cost \$5", &vars, false), "cost $5");
        assert_eq!(expand_vars(r"echo \$NAME", &vars, true), r"echo \$NAME");
        assert_eq!(expand_vars("$1 $", &vars, false), "$1 $");
    }

    #[test]
    fn test_expand_leaves_cmd_alone() {
        let mut vars = BTreeMap::new();
        vars.insert("X".to_string(), "1".to_string());
        let cmd = Instruction::Cmd {
            exec: vec!["echo".into(), "$X".into()],
        };
        assert_eq!(cmd.expand(&vars), cmd);
        let run = Instruction::Run {
            command: CommandForm::Shell("echo $X".into()),
        };
        assert_eq!(run.expand(&vars).to_string(), "RUN echo 1");
    }

    #[test]
    fn test_canonical_display() {
        assert_eq!(
            only("COPY --from=build a b /dst/").to_string(),
            "COPY --from=build a b /dst/"
        );
        assert_eq!(
            only(r#"ENV MSG="hi there" A=1"#).to_string(),
            r#"ENV MSG="hi there" A=1"#
        );
    }
}
