//! Build descriptor parsing.
//!
//! The descriptor is line oriented: one instruction per logical line, a
//! trailing `\` continues the line, full-line `#` comments and blank lines
//! are ignored, keywords are case-insensitive. Every stage block starts with
//! `FROM <image|stage|scratch> [AS <alias>]`.
//!
//! `ARG` declarations are consumed here rather than becoming instructions.
//! Global ARGs (before the first FROM) may be used in FROM lines; stage ARGs
//! are substituted (`$NAME`, `${NAME}`) into the stage's later instructions.
//! Shell-form commands only see ARG values, never ENV values; the shell
//! expands those itself at run time.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use kiln_common::{KilnError, KilnResult};

use crate::instruction::{
    Command, CopyInstruction, Healthcheck, HealthcheckSpec, Instruction, PortSpec, Protocol,
};

/// Build arguments supplied on the command line (`--build-arg K=V`).
pub type BuildArgs = BTreeMap<String, String>;

/// A parsed build descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Stage blocks in declaration order.
    pub stages: Vec<StageBlock>,
}

/// One `FROM` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBlock {
    /// Line of the `FROM` instruction.
    pub line: usize,
    /// Base reference: an image, `scratch`, or another stage's alias.
    pub base: String,
    /// `AS` alias.
    pub alias: Option<String>,
    /// Instructions after `FROM`.
    pub instructions: Vec<Instruction>,
}

impl Descriptor {
    /// Parse a descriptor from a file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or a parse error.
    pub fn from_file(path: &Path, build_args: &BuildArgs) -> KilnResult<Self> {
        let content = std::fs::read_to_string(path)?;
        parse_descriptor(&content, build_args)
    }
}

/// Parse descriptor text.
///
/// # Errors
///
/// Returns [`KilnError::Parse`] for malformed instructions.
pub fn parse_descriptor(content: &str, build_args: &BuildArgs) -> KilnResult<Descriptor> {
    let mut parser = Parser::new(build_args);
    for (line, text) in logical_lines(content) {
        parser.line(line, &text)?;
    }
    parser.finish()
}

/// Join continuation lines and drop comments and blank lines.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut result = Vec::new();
    let mut current: Option<(usize, String)> = None;

    for (idx, raw) in content.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.starts_with('#') || (trimmed.is_empty() && current.is_none()) {
            continue;
        }

        let (body, continues) = match trimmed.strip_suffix('\\') {
            Some(body) => (body.trim_end(), true),
            None => (trimmed, false),
        };

        match current.as_mut() {
            Some((_, text)) => {
                if !body.is_empty() {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(body);
                }
            }
            None => current = Some((idx + 1, body.to_string())),
        }

        if !continues {
            if let Some(done) = current.take() {
                if !done.1.is_empty() {
                    result.push(done);
                }
            }
        }
    }

    if let Some(done) = current.filter(|(_, text)| !text.is_empty()) {
        result.push(done);
    }

    result
}

struct Parser<'a> {
    build_args: &'a BuildArgs,
    global_args: BTreeMap<String, String>,
    stage_args: BTreeMap<String, String>,
    stage_env: BTreeMap<String, String>,
    aliases: HashSet<String>,
    stages: Vec<StageBlock>,
}

impl<'a> Parser<'a> {
    fn new(build_args: &'a BuildArgs) -> Self {
        Self {
            build_args,
            global_args: BTreeMap::new(),
            stage_args: BTreeMap::new(),
            stage_env: BTreeMap::new(),
            aliases: HashSet::new(),
            stages: Vec::new(),
        }
    }

    fn finish(self) -> KilnResult<Descriptor> {
        if self.stages.is_empty() {
            return Err(KilnError::parse(
                1,
                "descriptor must contain at least one FROM instruction",
            ));
        }
        Ok(Descriptor {
            stages: self.stages,
        })
    }

    fn line(&mut self, line: usize, text: &str) -> KilnResult<()> {
        let (keyword, rest) = match text.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (text, ""),
        };
        let keyword = keyword.to_ascii_uppercase();

        if keyword == "FROM" {
            return self.from(line, rest);
        }
        if keyword == "ARG" {
            return self.arg(line, rest);
        }
        if self.stages.is_empty() {
            return Err(KilnError::parse(
                line,
                format!("{keyword} before the first FROM; only ARG may precede FROM"),
            ));
        }

        let instruction = match keyword.as_str() {
            "RUN" => Instruction::Run(self.command(line, "RUN", rest)?),
            "COPY" => Instruction::Copy(self.copy(line, rest)?),
            "ENV" => {
                let vars = self.env(line, rest)?;
                self.stage_env.extend(vars.iter().cloned());
                Instruction::Env(vars)
            }
            "LABEL" => Instruction::Label(self.pairs(line, "LABEL", &self.expand(rest))?),
            "USER" => Instruction::User(self.single(line, "USER", rest)?),
            "WORKDIR" => Instruction::Workdir(self.required(line, "WORKDIR", rest)?),
            "EXPOSE" => Instruction::Expose(self.expose(line, rest)?),
            "HEALTHCHECK" => Instruction::Healthcheck(self.healthcheck(line, rest)?),
            "ENTRYPOINT" => Instruction::Entrypoint(self.command(line, "ENTRYPOINT", rest)?),
            "CMD" => Instruction::Cmd(self.command(line, "CMD", rest)?),
            "ADD" | "VOLUME" | "SHELL" | "STOPSIGNAL" | "ONBUILD" => {
                return Err(KilnError::parse(
                    line,
                    format!("unsupported instruction: {keyword}"),
                ));
            }
            _ => {
                return Err(KilnError::parse(
                    line,
                    format!("unknown instruction: {keyword}"),
                ));
            }
        };

        if let Some(stage) = self.stages.last_mut() {
            stage.instructions.push(instruction);
        }
        Ok(())
    }

    fn from(&mut self, line: usize, rest: &str) -> KilnResult<()> {
        let rest = substitute(rest, &self.global_args);
        let words: Vec<&str> = rest.split_whitespace().collect();
        let (base, alias) = match words.as_slice() {
            [flag, ..] if flag.starts_with("--") => {
                return Err(KilnError::parse(
                    line,
                    format!("unsupported FROM flag: {flag}"),
                ));
            }
            [base] => (*base, None),
            [base, as_kw, alias] if as_kw.eq_ignore_ascii_case("AS") => (*base, Some(*alias)),
            [] => {
                return Err(KilnError::parse(line, "FROM requires an image reference"));
            }
            _ => {
                return Err(KilnError::parse(
                    line,
                    "expected `FROM <image> [AS <alias>]`",
                ));
            }
        };

        let alias = match alias {
            Some(alias) => {
                if !is_valid_alias(alias) {
                    return Err(KilnError::parse(
                        line,
                        format!("invalid stage alias: {alias}"),
                    ));
                }
                if !self.aliases.insert(alias.to_ascii_lowercase()) {
                    return Err(KilnError::parse(
                        line,
                        format!("duplicate stage alias: {alias}"),
                    ));
                }
                Some(alias.to_string())
            }
            None => None,
        };

        self.stage_args.clear();
        self.stage_env.clear();
        self.stages.push(StageBlock {
            line,
            base: base.to_string(),
            alias,
            instructions: Vec::new(),
        });
        Ok(())
    }

    fn arg(&mut self, line: usize, rest: &str) -> KilnResult<()> {
        let (name, default) = match rest.split_once('=') {
            Some((name, default)) => (name.trim(), Some(unquote(default.trim()))),
            None => (rest.trim(), None),
        };
        if !is_valid_name(name) {
            return Err(KilnError::parse(line, format!("invalid ARG name: '{name}'")));
        }

        if self.stages.is_empty() {
            let value = self
                .build_args
                .get(name)
                .cloned()
                .or(default)
                .unwrap_or_default();
            self.global_args.insert(name.to_string(), value);
        } else {
            let value = self
                .build_args
                .get(name)
                .cloned()
                .or(default.map(|d| substitute(&d, &self.stage_args)))
                .or_else(|| self.global_args.get(name).cloned())
                .unwrap_or_default();
            self.stage_args.insert(name.to_string(), value);
        }
        Ok(())
    }

    /// ARG and ENV values in scope, for non-shell instructions.
    fn expand(&self, text: &str) -> String {
        let mut vars = self.stage_env.clone();
        vars.extend(self.stage_args.iter().map(|(k, v)| (k.clone(), v.clone())));
        substitute(text, &vars)
    }

    fn required(&self, line: usize, keyword: &str, rest: &str) -> KilnResult<String> {
        let value = self.expand(rest);
        if value.trim().is_empty() {
            return Err(KilnError::parse(
                line,
                format!("{keyword} requires an argument"),
            ));
        }
        Ok(value.trim().to_string())
    }

    fn single(&self, line: usize, keyword: &str, rest: &str) -> KilnResult<String> {
        let value = self.required(line, keyword, rest)?;
        if value.split_whitespace().count() != 1 {
            return Err(KilnError::parse(
                line,
                format!("{keyword} takes exactly one argument"),
            ));
        }
        Ok(value)
    }

    fn command(&self, line: usize, keyword: &str, rest: &str) -> KilnResult<Command> {
        if rest.is_empty() {
            return Err(KilnError::parse(
                line,
                format!("{keyword} requires a command"),
            ));
        }

        if rest.starts_with('[') {
            let args: Vec<String> = serde_json::from_str(rest).map_err(|e| {
                KilnError::parse(line, format!("{keyword} exec form is not a JSON string array: {e}"))
            })?;
            if args.is_empty() {
                return Err(KilnError::parse(
                    line,
                    format!("{keyword} exec form must not be empty"),
                ));
            }
            return Ok(Command::Exec(
                args.iter().map(|a| substitute(a, &self.stage_args)).collect(),
            ));
        }

        Ok(Command::Shell(substitute(rest, &self.stage_args)))
    }

    fn copy(&self, line: usize, rest: &str) -> KilnResult<CopyInstruction> {
        let expanded = self.expand(rest);
        let mut words = expanded.split_whitespace().peekable();
        let mut from = None;

        while let Some(flag) = words.next_if(|w| w.starts_with("--")) {
            match flag.split_once('=') {
                Some(("--from", stage)) if !stage.is_empty() => from = Some(stage.to_string()),
                Some(("--from", _)) => {
                    return Err(KilnError::parse(line, "COPY --from requires a stage"));
                }
                _ => {
                    return Err(KilnError::parse(
                        line,
                        format!("unsupported COPY flag: {flag}"),
                    ));
                }
            }
        }

        let mut paths: Vec<String> = words.map(str::to_string).collect();
        if paths.len() < 2 {
            return Err(KilnError::parse(
                line,
                "COPY requires at least one source and a destination",
            ));
        }
        let destination = paths.pop().unwrap_or_default();

        Ok(CopyInstruction {
            from,
            sources: paths,
            destination,
        })
    }

    fn env(&self, line: usize, rest: &str) -> KilnResult<Vec<(String, String)>> {
        let expanded = self.expand(rest);
        let trimmed = expanded.trim_start();
        let (first, value) = trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((trimmed, ""));
        if !first.is_empty() && !first.contains('=') {
            // Legacy `ENV KEY value with spaces`
            let value = value.trim();
            if !is_valid_name(first) {
                return Err(KilnError::parse(line, format!("invalid ENV name: '{first}'")));
            }
            return Ok(vec![(first.to_string(), unquote(value))]);
        }
        self.pairs(line, "ENV", &expanded)
    }

    fn pairs(&self, line: usize, keyword: &str, text: &str) -> KilnResult<Vec<(String, String)>> {
        let words = split_words(text)
            .map_err(|message| KilnError::parse(line, format!("{keyword}: {message}")))?;
        if words.is_empty() {
            return Err(KilnError::parse(
                line,
                format!("{keyword} requires at least one key=value pair"),
            ));
        }

        words
            .into_iter()
            .map(|word| match word.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
                _ => Err(KilnError::parse(
                    line,
                    format!("{keyword} expects key=value, got '{word}'"),
                )),
            })
            .collect()
    }

    fn expose(&self, line: usize, rest: &str) -> KilnResult<Vec<PortSpec>> {
        let expanded = self.expand(rest);
        let ports: Vec<PortSpec> = expanded
            .split_whitespace()
            .map(|spec| parse_port(spec).ok_or_else(|| {
                KilnError::parse(line, format!("invalid port specification: {spec}"))
            }))
            .collect::<KilnResult<_>>()?;
        if ports.is_empty() {
            return Err(KilnError::parse(line, "EXPOSE requires at least one port"));
        }
        Ok(ports)
    }

    fn healthcheck(&self, line: usize, rest: &str) -> KilnResult<Healthcheck> {
        if rest.eq_ignore_ascii_case("NONE") {
            return Ok(Healthcheck::Disabled);
        }

        let mut interval = HealthcheckSpec::DEFAULT_INTERVAL;
        let mut timeout = HealthcheckSpec::DEFAULT_TIMEOUT;
        let mut start_period = Duration::ZERO;
        let mut retries = HealthcheckSpec::DEFAULT_RETRIES;

        let mut remaining = rest.trim_start();
        while remaining.starts_with("--") {
            let end = remaining
                .find(char::is_whitespace)
                .unwrap_or(remaining.len());
            let flag = &remaining[..end];
            remaining = remaining[end..].trim_start();

            let (name, value) = flag.split_once('=').ok_or_else(|| {
                KilnError::parse(line, format!("HEALTHCHECK flag needs a value: {flag}"))
            })?;
            let bad_value =
                || KilnError::parse(line, format!("invalid value for {name}: {value}"));
            match name {
                "--interval" => interval = parse_duration(value).ok_or_else(bad_value)?,
                "--timeout" => timeout = parse_duration(value).ok_or_else(bad_value)?,
                "--start-period" => start_period = parse_duration(value).ok_or_else(bad_value)?,
                "--retries" => retries = value.parse().map_err(|_| bad_value())?,
                _ => {
                    return Err(KilnError::parse(
                        line,
                        format!("unsupported HEALTHCHECK flag: {name}"),
                    ));
                }
            }
        }

        let command = match remaining.split_once(char::is_whitespace) {
            Some((cmd_kw, command)) if cmd_kw.eq_ignore_ascii_case("CMD") => {
                self.command(line, "HEALTHCHECK", command.trim())?
            }
            _ => {
                return Err(KilnError::parse(
                    line,
                    "expected `HEALTHCHECK [options] CMD <command>` or `HEALTHCHECK NONE`",
                ));
            }
        };

        Ok(Healthcheck::Check(HealthcheckSpec {
            command,
            interval,
            timeout,
            start_period,
            retries,
        }))
    }
}

/// Replace `$NAME` and `${NAME}` for names present in `vars`. Anything else,
/// including unknown references, is left verbatim.
fn substitute(text: &str, vars: &BTreeMap<String, String>) -> String {
    if vars.is_empty() || !text.contains('$') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match vars.get(name) {
            Some(value) if !name.is_empty() => {
                out.push_str(value);
                rest = &after[consumed..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Split on whitespace, honouring single and double quotes and backslash
/// escapes; quotes are removed.
fn split_words(text: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = text.chars();

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
            (None, '"' | '\'') => {
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
        return Err("unterminated quote".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn unquote(value: &str) -> String {
    split_words(value)
        .ok()
        .filter(|words| words.len() == 1)
        .and_then(|mut words| words.pop())
        .unwrap_or_else(|| value.to_string())
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_valid_alias(alias: &str) -> bool {
    let mut chars = alias.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn parse_port(spec: &str) -> Option<PortSpec> {
    let (port, protocol) = match spec.split_once('/') {
        Some((port, proto)) => {
            let protocol = match proto.to_ascii_lowercase().as_str() {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                _ => return None,
            };
            (port, protocol)
        }
        None => (spec, Protocol::Tcp),
    };
    let port: u16 = port.parse().ok().filter(|p| *p > 0)?;
    Some(PortSpec { port, protocol })
}

/// Parse durations such as `30s`, `500ms`, `1m30s`, `2h`.
pub(crate) fn parse_duration(text: &str) -> Option<Duration> {
    if text.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let amount: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let piece = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.checked_mul(60)?),
            "h" => Duration::from_secs(amount.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(piece)?;
        rest = &rest[unit_len..];
    }
    Some(total)
}
