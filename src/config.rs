//! `mirror.list`-style configuration: typed record plus a small line-based
//! parser for the grammar described in spec.md §6.
//!
//! The parser is deliberately thin - it is the "configuration-file lexer"
//! the specification calls out as an external collaborator rather than core
//! engine logic.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, format_err, Context, Error};

use crate::{error::ConfigError, types::Repository};

/// `clean` directive mode (spec.md §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanMode {
    Off,
    On,
    Auto,
    Both,
}

impl Default for CleanMode {
    fn default() -> Self {
        CleanMode::On
    }
}

impl CleanMode {
    fn parse(value: &str) -> Result<Self, Error> {
        Ok(match value {
            "off" => CleanMode::Off,
            "on" => CleanMode::On,
            "auto" => CleanMode::Auto,
            "both" => CleanMode::Both,
            other => bail!("invalid value for 'clean': {other}"),
        })
    }

    pub fn writes_script(&self) -> bool {
        matches!(self, CleanMode::On | CleanMode::Both)
    }

    pub fn unlinks(&self) -> bool {
        matches!(self, CleanMode::Auto | CleanMode::Both)
    }
}

/// Typed configuration record. Every `set` key from spec.md §6 is an
/// explicit field; unknown keys warn and are ignored (forward compat).
#[derive(Debug, Clone)]
pub struct Config {
    pub base_path: PathBuf,
    pub mirror_path: PathBuf,
    pub skel_path: PathBuf,
    pub var_path: PathBuf,
    pub defaultarch: String,
    pub nthreads: usize,
    pub limit_rate: Option<u64>,
    pub unlink: bool,
    pub use_proxy: bool,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
    pub verify_checksums: bool,
    pub verify_gpg: bool,
    pub gpg_keyring: Option<PathBuf>,
    pub resume_partial_downloads: bool,
    pub retry_attempts: u32,
    pub retry_delay: f64,
    pub clean: CleanMode,
    pub run_postmirror: bool,
    pub postmirror_script: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,

    pub repositories: Vec<Repository>,
    /// Base URLs opted into GC via `clean <base-url>` (spec.md §9, open
    /// question (b)): a prefix must appear here for GC to touch it.
    pub clean_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let base_path = PathBuf::from("/var/spool/apt-mirror");
        Config {
            mirror_path: base_path.join("mirror"),
            skel_path: base_path.join("skel"),
            var_path: base_path.join("var"),
            base_path,
            defaultarch: default_host_arch(),
            nthreads: 20,
            limit_rate: None,
            unlink: false,
            use_proxy: false,
            http_proxy: None,
            https_proxy: None,
            proxy_user: None,
            proxy_password: None,
            verify_checksums: true,
            verify_gpg: false,
            gpg_keyring: None,
            resume_partial_downloads: true,
            retry_attempts: 5,
            retry_delay: 2.0,
            clean: CleanMode::default(),
            run_postmirror: false,
            postmirror_script: None,
            connect_timeout_secs: 30,
            idle_timeout_secs: 60,
            repositories: Vec::new(),
            clean_prefixes: Vec::new(),
        }
    }
}

impl Config {
    /// Whether `clean <base-url>` was used to opt `repo_uri` into garbage
    /// collection.
    pub fn clean_allowed(&self, repo_uri: &str) -> bool {
        self.clean_prefixes
            .iter()
            .any(|prefix| repo_uri.starts_with(prefix.as_str()))
    }
}

fn default_host_arch() -> String {
    // mirrors `dpkg --print-architecture` on the common targets; callers on
    // an unlisted architecture must set `defaultarch` explicitly.
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "x86" => "i386",
        other => other,
    }
    .to_string()
}

/// Parse a `mirror.list`-format configuration file at `path`, followed by
/// every `*.list` fragment under a sibling `mirror.list.d/` directory (if
/// any), applied in alphabetical order onto the same accumulator.
pub fn load(path: &Path) -> Result<Config, Error> {
    load_inner(path).map_err(|err| anyhow::Error::new(ConfigError(format!("{err:#}"))))
}

fn load_inner(path: &Path) -> Result<Config, Error> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    let mut config = Config::default();
    parse(&contents, &mut config).with_context(|| format!("parsing {path:?}"))?;

    let fragments_dir = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("mirror.list.d");
    if fragments_dir.is_dir() {
        let mut fragment_paths: Vec<PathBuf> = fs::read_dir(&fragments_dir)
            .with_context(|| format!("reading {fragments_dir:?}"))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().map(|ext| ext == "list").unwrap_or(false))
            .collect();
        fragment_paths.sort();

        for fragment_path in fragment_paths {
            let contents = fs::read_to_string(&fragment_path)
                .with_context(|| format!("reading config fragment {fragment_path:?}"))?;
            parse(&contents, &mut config)
                .with_context(|| format!("parsing {fragment_path:?}"))?;
        }
    }

    if config.repositories.is_empty() {
        bail!("no 'deb'/'deb-src' lines configured");
    }

    apply_default_architecture(&mut config);

    Ok(config)
}

/// A `deb` line with no `[arch=…]` option mirrors `config.defaultarch`
/// (spec.md §6); applied once all files/fragments are parsed so a
/// `set defaultarch` directive anywhere in the config takes effect
/// regardless of where relative to the `deb` lines it appears.
pub(crate) fn apply_default_architecture(config: &mut Config) {
    for repo in &mut config.repositories {
        if !repo.source && repo.architectures.is_empty() {
            repo.architectures.push(config.defaultarch.clone());
        }
    }
}

/// Parse `contents` into `config`, applying `set`/`deb`/`deb-src`/`clean`
/// directives in order. Exposed separately from [`load`] so fragments from
/// multiple files can be folded into one accumulator.
pub fn parse(contents: &str, config: &mut Config) -> Result<(), Error> {
    let mut vars: HashMap<String, String> = HashMap::new();

    for (lineno, raw_line) in contents.lines().enumerate() {
        let lineno = lineno + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let line = expand_vars(line, &vars);
        let mut words = line.split_whitespace();
        let keyword = words
            .next()
            .ok_or_else(|| format_err!("line {lineno}: empty directive"))?;

        match keyword {
            "set" => {
                let key = words
                    .next()
                    .ok_or_else(|| format_err!("line {lineno}: 'set' missing key"))?;
                let value = words.collect::<Vec<_>>().join(" ");
                if value.is_empty() {
                    bail!("line {lineno}: 'set {key}' missing value");
                }
                vars.insert(key.to_string(), value.clone());
                apply_set(config, key, &value)
                    .with_context(|| format!("line {lineno}: set {key} {value}"))?;
            }
            "deb" | "deb-src" => {
                let rest: Vec<&str> = words.collect();
                let repo = parse_repo_line(keyword, &rest)
                    .with_context(|| format!("line {lineno}: {line}"))?;
                merge_or_push_repository(&mut config.repositories, repo);
            }
            "clean" => {
                let url = words
                    .next()
                    .ok_or_else(|| format_err!("line {lineno}: 'clean' missing base URL"))?;
                config.clean_prefixes.push(url.to_string());
            }
            other => bail!("line {lineno}: unrecognized directive '{other}'"),
        }
    }

    Ok(())
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn expand_vars(line: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut name = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_alphanumeric() || next == '_' {
                    name.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if let Some(value) = vars.get(&name) {
                out.push_str(value);
            } else {
                out.push('$');
                out.push_str(&name);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn apply_set(config: &mut Config, key: &str, value: &str) -> Result<(), Error> {
    match key {
        "base_path" => {
            config.base_path = PathBuf::from(value);
            config.mirror_path = config.base_path.join("mirror");
            config.skel_path = config.base_path.join("skel");
            config.var_path = config.base_path.join("var");
        }
        "mirror_path" => config.mirror_path = PathBuf::from(value),
        "skel_path" => config.skel_path = PathBuf::from(value),
        "var_path" => config.var_path = PathBuf::from(value),
        "defaultarch" => config.defaultarch = value.to_string(),
        "nthreads" => config.nthreads = value.parse().context("nthreads must be an integer")?,
        "limit_rate" => config.limit_rate = Some(parse_rate(value)?),
        "unlink" => config.unlink = parse_bool(value)?,
        "use_proxy" => config.use_proxy = parse_bool(value)?,
        "http_proxy" => config.http_proxy = Some(value.to_string()),
        "https_proxy" => config.https_proxy = Some(value.to_string()),
        "proxy_user" => config.proxy_user = Some(value.to_string()),
        "proxy_password" => config.proxy_password = Some(value.to_string()),
        "verify_checksums" => config.verify_checksums = parse_bool(value)?,
        "verify_gpg" => config.verify_gpg = parse_bool(value)?,
        "gpg_keyring" => config.gpg_keyring = Some(PathBuf::from(value)),
        "resume_partial_downloads" => config.resume_partial_downloads = parse_bool(value)?,
        "retry_attempts" => {
            config.retry_attempts = value.parse().context("retry_attempts must be an integer")?
        }
        "retry_delay" => {
            config.retry_delay = value.parse().context("retry_delay must be a number")?
        }
        "clean" => config.clean = CleanMode::parse(value)?,
        "run_postmirror" => config.run_postmirror = parse_bool(value)?,
        "postmirror_script" => config.postmirror_script = Some(PathBuf::from(value)),
        unknown => {
            eprintln!("warning: unrecognized config key '{unknown}', ignoring");
        }
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool, Error> {
    match value {
        "1" | "on" | "yes" | "true" => Ok(true),
        "0" | "off" | "no" | "false" => Ok(false),
        other => bail!("expected boolean value, got '{other}'"),
    }
}

fn parse_rate(value: &str) -> Result<u64, Error> {
    let (number, multiplier) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1024),
        Some('m') | Some('M') => (&value[..value.len() - 1], 1024 * 1024),
        _ => (value, 1),
    };
    let base: u64 = number
        .parse()
        .with_context(|| format!("invalid rate limit '{value}'"))?;
    Ok(base * multiplier)
}

fn parse_repo_line(keyword: &str, rest: &[&str]) -> Result<Repository, Error> {
    let mut architectures: Vec<String> = Vec::new();
    let mut signed_by = None;
    let mut positional = Vec::new();

    for word in rest {
        if let Some(stripped) = word.strip_prefix('[').and_then(|w| w.strip_suffix(']')) {
            for option in stripped.split_whitespace() {
                if let Some((key, value)) = option.split_once('=') {
                    match key {
                        "arch" => architectures = value.split(',').map(str::to_string).collect(),
                        "signed-by" => signed_by = Some(PathBuf::from(value)),
                        _ => { /* unsupported option; ignored for forward-compat */ }
                    }
                }
            }
        } else {
            positional.push(*word);
        }
    }

    if positional.len() < 3 {
        bail!("'{keyword}' line needs <url> <suite> <component>...");
    }

    let url = positional[0];
    let suite = positional[1];
    let components: Vec<&str> = positional[2..].to_vec();

    let line = format!("{keyword} {url} {suite} {}", components.join(" "));
    let repository = crate::metadata::parse_repo_line(&line)?;

    Ok(Repository {
        repository,
        architectures,
        source: keyword == "deb-src",
        signed_by,
    })
}

/// Fold `repo` into `repositories`, unioning components (and architectures)
/// with an existing entry that shares the same host+suite+source-type
/// (spec.md §9, open question (a): two `deb` lines differing only in
/// components are one repository, not two).
fn merge_or_push_repository(repositories: &mut Vec<Repository>, repo: Repository) {
    let same_repo = repositories.iter_mut().find(|existing| {
        existing.source == repo.source
            && existing.repository.uris.first() == repo.repository.uris.first()
            && existing.repository.suites.first() == repo.repository.suites.first()
    });

    match same_repo {
        Some(existing) => {
            for component in repo.repository.components.clone() {
                if !existing.repository.components.contains(&component) {
                    existing.repository.components.push(component);
                }
            }
            for arch in repo.architectures {
                if !existing.architectures.contains(&arch) {
                    existing.architectures.push(arch);
                }
            }
            existing.signed_by = existing.signed_by.clone().or(repo.signed_by);
        }
        None => repositories.push(repo),
    }
}
