//! Dockerfile parsing
//!
//! Only the configuration an image carries is modelled: `RUN` and
//! `ONBUILD` are accepted and ignored, and for multi-stage files only the
//! final stage survives.

use crate::api::types::{ContainerConfig, EmptyObject, HealthcheckConfig};
use crate::error::{Result, SockerlessError};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Default Dockerfile name inside a build context
pub const DOCKERFILE_NAME: &str = "Dockerfile";

/// One `COPY`/`ADD` source and its destination in the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyInstruction {
    pub src: String,
    pub dest: String,
}

/// Result of parsing a Dockerfile
#[derive(Debug, Clone, Default)]
pub struct ParsedDockerfile {
    /// Base image of the final stage
    pub from: String,
    pub config: ContainerConfig,
    pub copies: Vec<CopyInstruction>,
}

/// Join `\`-continued lines
pub fn join_continuations(content: &str) -> String {
    content.replace("\\\r\n", " ").replace("\\\n", " ")
}

/// Instruction lines in order, blank lines and comments removed
pub fn instruction_lines(content: &str) -> Vec<String> {
    join_continuations(content)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Parse a Dockerfile; `build_args` override `ARG` defaults
pub fn parse_dockerfile(content: &str, build_args: &HashMap<String, String>) -> Result<ParsedDockerfile> {
    let mut parsed = ParsedDockerfile::default();
    let mut args = build_args.clone();

    for (index, line) in instruction_lines(content).iter().enumerate() {
        let Some((instruction, rest)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let instruction = instruction.to_uppercase();
        let rest = substitute_args(rest.trim(), &args);

        match instruction.as_str() {
            "FROM" => {
                if !parsed.from.is_empty() {
                    parsed.config = ContainerConfig::default();
                    parsed.copies.clear();
                }
                let Some(image) = rest.split_whitespace().next() else {
                    return Err(SockerlessError::DockerfileParse {
                        line: index + 1,
                        message: "FROM requires an image".to_string(),
                    });
                };
                parsed.from = image.to_string();
            }
            "COPY" | "ADD" => {
                let fields: Vec<&str> = rest.split_whitespace().collect();
                if fields.len() < 2 || fields[0].starts_with("--from=") {
                    continue;
                }
                let last = fields.len() - 1;
                let first_src = fields[..last]
                    .iter()
                    .position(|f| !f.starts_with("--"))
                    .unwrap_or(last);
                let dest = fields[last];
                parsed
                    .copies
                    .extend(fields[first_src..last].iter().map(|src| CopyInstruction {
                        src: src.to_string(),
                        dest: dest.to_string(),
                    }));
            }
            "ENV" => {
                let (key, value) = parse_env(&rest);
                if !key.is_empty() {
                    parsed.config.env.push(format!("{}={}", key, value));
                }
            }
            "CMD" => parsed.config.cmd = parse_shell_or_exec(&rest),
            "ENTRYPOINT" => parsed.config.entrypoint = parse_shell_or_exec(&rest),
            "SHELL" => parsed.config.shell = parse_shell_or_exec(&rest),
            "WORKDIR" => parsed.config.working_dir = rest,
            "USER" => parsed.config.user = rest,
            "STOPSIGNAL" => parsed.config.stop_signal = rest,
            "ARG" => {
                if let Some((name, default)) = rest.split_once('=') {
                    args.entry(name.to_string())
                        .or_insert_with(|| default.to_string());
                }
            }
            "LABEL" => parse_labels(&rest, &mut parsed.config.labels),
            "EXPOSE" => {
                for port in rest.split_whitespace() {
                    let port = if port.contains('/') {
                        port.to_string()
                    } else {
                        format!("{}/tcp", port)
                    };
                    parsed.config.exposed_ports.insert(port, EmptyObject {});
                }
            }
            "HEALTHCHECK" => parsed.config.healthcheck = Some(parse_healthcheck(&rest)),
            "VOLUME" => {
                for path in parse_volume(&rest) {
                    parsed.config.volumes.insert(path, EmptyObject {});
                }
            }
            _ => {}
        }
    }

    if parsed.from.is_empty() {
        return Err(SockerlessError::DockerfileParse {
            line: 0,
            message: "no FROM instruction found".to_string(),
        });
    }
    Ok(parsed)
}

fn arg_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("argument pattern is valid")
    })
}

/// Replace `${NAME}` and `$NAME` with build argument values.
///
/// Names match in full, so `$FOO` never clobbers `$FOOBAR`; unknown
/// references are left as written.
pub fn substitute_args(s: &str, args: &HashMap<String, String>) -> String {
    if args.is_empty() {
        return s.to_string();
    }
    arg_pattern()
        .replace_all(s, |caps: &regex::Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            match args.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// `K=V` (quotes stripped) or `K V...` where the value is the whole tail
pub fn parse_env(rest: &str) -> (String, String) {
    let rest = rest.trim();
    let first = rest.split_whitespace().next().unwrap_or("");
    if first.contains('=') {
        if let Some((key, value)) = rest.split_once('=') {
            return (
                key.to_string(),
                value.trim_matches(|c| c == '"' || c == '\'').to_string(),
            );
        }
    }
    match rest.split_once(char::is_whitespace) {
        Some((key, value)) => (key.to_string(), value.trim_start().to_string()),
        None => (rest.to_string(), String::new()),
    }
}

/// JSON array form, else whitespace split
pub fn parse_shell_or_exec(rest: &str) -> Vec<String> {
    let rest = rest.trim();
    if rest.starts_with('[') {
        if let Ok(arr) = serde_json::from_str::<Vec<String>>(rest) {
            return arr;
        }
    }
    rest.split_whitespace().map(str::to_string).collect()
}

fn parse_volume(rest: &str) -> Vec<String> {
    let rest = rest.trim();
    if rest.starts_with('[') {
        return serde_json::from_str(rest).unwrap_or_default();
    }
    rest.split_whitespace().map(str::to_string).collect()
}

fn parse_labels(rest: &str, labels: &mut HashMap<String, String>) {
    for field in rest.split_whitespace() {
        if let Some((key, value)) = field.split_once('=') {
            labels.insert(
                key.to_string(),
                value.trim_matches(|c| c == '"' || c == '\'').to_string(),
            );
        }
    }
}

/// `NONE`, or `[--opt=value ...] CMD <exec or shell form>`
pub fn parse_healthcheck(rest: &str) -> HealthcheckConfig {
    let mut rest = rest.trim();
    if rest.eq_ignore_ascii_case("NONE") {
        return HealthcheckConfig {
            test: vec!["NONE".to_string()],
            ..Default::default()
        };
    }

    let mut hc = HealthcheckConfig::default();
    while rest.starts_with("--") {
        let Some(end) = rest.find(char::is_whitespace) else {
            break;
        };
        let opt = &rest[..end];
        rest = rest[end..].trim_start();

        let Some((key, value)) = opt.split_once('=') else {
            continue;
        };
        let nanos = || parse_duration(value).map(|d| d.as_nanos() as i64).unwrap_or(0);
        match key {
            "--interval" => hc.interval = nanos(),
            "--timeout" => hc.timeout = nanos(),
            "--start-period" => hc.start_period = nanos(),
            "--retries" => {
                hc.retries = value
                    .chars()
                    .filter(char::is_ascii_digit)
                    .fold(0u32, |n, c| n.saturating_mul(10).saturating_add(c as u32 - '0' as u32));
            }
            _ => {}
        }
    }

    let is_cmd = rest
        .get(..3)
        .map(|p| p.eq_ignore_ascii_case("CMD"))
        .unwrap_or(false);
    if !is_cmd {
        return hc;
    }
    let command = rest[3..].trim();
    if command.starts_with('[') {
        if let Ok(arr) = serde_json::from_str::<Vec<String>>(command) {
            hc.test = std::iter::once("CMD".to_string()).chain(arr).collect();
            return hc;
        }
    }
    hc.test = vec!["CMD-SHELL".to_string(), command.to_string()];
    hc
}

/// Parse durations like `5s`, `1m30s`, `500ms`, `1.5h`
pub fn parse_duration(s: &str) -> Option<Duration> {
    // nanoseconds per unit
    const UNITS: [(&str, f64); 7] = [
        ("ns", 1.0),
        ("us", 1e3),
        ("µs", 1e3),
        ("ms", 1e6),
        ("s", 1e9),
        ("m", 6e10),
        ("h", 3.6e12),
    ];

    let s = s.trim();
    if s == "0" {
        return Some(Duration::ZERO);
    }
    if s.is_empty() {
        return None;
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        let (_, scale) = UNITS.iter().find(|(name, _)| *name == unit)?;
        total += value * scale;
        rest = &rest[unit_end..];
    }
    Some(Duration::from_nanos(total.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> ParsedDockerfile {
        parse_dockerfile(content, &HashMap::new()).unwrap()
    }

    #[test]
    fn test_parse_basic() {
        let df = parse(
            r#"
# comment
FROM alpine:3.19
ENV PATH=/usr/bin
WORKDIR /app
COPY --chown=1000 a.txt b.txt /app/
RUN apk add curl
EXPOSE 8080
EXPOSE 53/udp
USER nobody
STOPSIGNAL SIGTERM
CMD ["./server", "--port", "8080"]
"#,
        );
        assert_eq!(df.from, "alpine:3.19");
        assert_eq!(df.config.env, vec!["PATH=/usr/bin"]);
        assert_eq!(df.config.working_dir, "/app");
        assert_eq!(df.config.cmd, vec!["./server", "--port", "8080"]);
        assert_eq!(df.config.user, "nobody");
        assert_eq!(df.config.stop_signal, "SIGTERM");
        assert!(df.config.exposed_ports.contains_key("8080/tcp"));
        assert!(df.config.exposed_ports.contains_key("53/udp"));
        assert_eq!(
            df.copies,
            vec![
                CopyInstruction {
                    src: "a.txt".into(),
                    dest: "/app/".into()
                },
                CopyInstruction {
                    src: "b.txt".into(),
                    dest: "/app/".into()
                },
            ]
        );
    }

    #[test]
    fn test_missing_from_is_error() {
        let err = parse_dockerfile("RUN true\n", &HashMap::new()).unwrap_err();
        assert!(matches!(err, SockerlessError::DockerfileParse { .. }));
    }

    #[test]
    fn test_multistage_keeps_final_stage() {
        let df = parse(
            "FROM golang AS build\nENV CGO=0\nCOPY . /src\n\
             FROM alpine\nCOPY --from=build /out/app /app\nCMD app\n",
        );
        assert_eq!(df.from, "alpine");
        assert!(df.config.env.is_empty());
        assert!(df.copies.is_empty());
        assert_eq!(df.config.cmd, vec!["app"]);
    }

    #[test]
    fn test_continuation_and_env_forms() {
        let df = parse("FROM x\nENV GREETING hello \\\n  big world\nENV QUOTED=\"a b\"\n");
        assert_eq!(df.config.env[0], "GREETING=hello    big world");
        assert_eq!(df.config.env[1], "QUOTED=a b");
    }

    #[test]
    fn test_env_space_form_value_with_equals() {
        assert_eq!(
            parse_env("GREETING hello=world"),
            ("GREETING".to_string(), "hello=world".to_string())
        );
        assert_eq!(parse_env("A=b=c"), ("A".to_string(), "b=c".to_string()));
        let df = parse("FROM x\nENV OPTS --level=3 --quiet\n");
        assert_eq!(df.config.env[0], "OPTS=--level=3 --quiet");
    }

    #[test]
    fn test_args_and_substitution() {
        let content = "ARG VERSION=1.0\nARG VERSION_SUFFIX=-rc\nFROM base:${VERSION}\nLABEL v=$VERSION_SUFFIX\n";
        let df = parse(content);
        assert_eq!(df.from, "base:1.0");
        assert_eq!(df.config.labels["v"], "-rc");

        let overrides = HashMap::from([("VERSION".to_string(), "2.0".to_string())]);
        let df = parse_dockerfile(content, &overrides).unwrap();
        assert_eq!(df.from, "base:2.0");
    }

    #[test]
    fn test_labels_quoted() {
        let df = parse("FROM x\nLABEL a=1 b=\"two\" c='3'\n");
        assert_eq!(df.config.labels["a"], "1");
        assert_eq!(df.config.labels["b"], "two");
        assert_eq!(df.config.labels["c"], "3");
    }

    #[test]
    fn test_healthcheck_forms() {
        let hc = parse_healthcheck("NONE");
        assert_eq!(hc.test, vec!["NONE"]);

        let hc = parse_healthcheck("--interval=5s --timeout=1m30s --retries=4 CMD curl -f http://x/");
        assert_eq!(hc.test, vec!["CMD-SHELL", "curl -f http://x/"]);
        assert_eq!(hc.interval, 5_000_000_000);
        assert_eq!(hc.timeout, 90_000_000_000);
        assert_eq!(hc.retries, 4);

        let hc = parse_healthcheck("--start-period=500ms CMD [\"pg_isready\", \"-q\"]");
        assert_eq!(hc.test, vec!["CMD", "pg_isready", "-q"]);
        assert_eq!(hc.start_period, 500_000_000);
    }

    #[test]
    fn test_volume_and_shell() {
        let df = parse("FROM x\nVOLUME [\"/data\", \"/logs\"]\nVOLUME /cache\nSHELL [\"bash\", \"-c\"]\n");
        assert_eq!(df.config.volumes.len(), 3);
        assert!(df.config.volumes.contains_key("/cache"));
        assert_eq!(df.config.shell, vec!["bash", "-c"]);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("abc"), None);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let content = "FROM x\nARG A=1\nARG AB=2\nENV K=$AB-$A\n";
        let first = parse(content);
        for _ in 0..10 {
            assert_eq!(parse(content).config.env, first.config.env);
        }
        assert_eq!(first.config.env, vec!["K=2-1"]);
    }

    #[test]
    fn test_substitute_whole_names_only() {
        let args = HashMap::from([("FOO".to_string(), "x".to_string())]);
        assert_eq!(substitute_args("$FOO/${FOO}", &args), "x/x");
        assert_eq!(substitute_args("$FOOBAR $OTHER", &args), "$FOOBAR $OTHER");
    }
}
