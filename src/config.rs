use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::backends::BackendId;
use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILENAME: &str = "breton-translator.toml";
pub const CONFIG_ENV: &str = "BRETON_TRANSLATOR_CONFIG";
pub const INDEX_URI_ENV: &str = "ZILLIZ_URI";
pub const INDEX_TOKEN_ENV: &str = "ZILLIZ_TOKEN";

pub const DEFAULT_COLLECTION: &str = "traductions_francais_breton";
pub const DEFAULT_ENCODER_MODEL: &str = "paraphrase-multilingual-mpnet-base-v2";

/// Raw config file contents. Every field is optional; `Settings::resolve`
/// fills in defaults and env overrides.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub index: IndexSection,
    #[serde(default)]
    pub encoder: EncoderSection,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub backends: HashMap<String, BackendSection>,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub trace: TraceSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct IndexSection {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub anns_field: Option<String>,
    #[serde(default)]
    pub metric_type: Option<String>,
    #[serde(default)]
    pub search_level: Option<u32>,
    #[serde(default)]
    pub source_field: Option<String>,
    #[serde(default)]
    pub target_field: Option<String>,
    #[serde(default)]
    pub load_timeout_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct EncoderSection {
    /// "ollama" or "openai".
    #[serde(default)]
    pub api: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct RetrievalSection {
    #[serde(default)]
    pub max_k: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct GenerationSection {
    #[serde(default)]
    pub max_input_tokens: Option<usize>,
    #[serde(default)]
    pub max_output_tokens: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct BackendSection {
    /// Checkpoint or served model name.
    #[serde(default)]
    pub model: Option<String>,
    /// Local model file for the native adapter.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Chat server base URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub target_marker: Option<String>,
    #[serde(default)]
    pub template_hint: Option<String>,
    #[serde(default)]
    pub ctx_size: Option<u32>,
    #[serde(default)]
    pub threads: Option<i32>,
    #[serde(default)]
    pub gpu_layers: Option<i32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<String>,
    /// "text" or "json".
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct TraceSection {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Clone, Debug)]
pub struct IndexSettings {
    pub uri: Option<String>,
    pub token: Option<String>,
    pub collection: String,
    pub anns_field: String,
    pub metric_type: String,
    pub search_level: u32,
    pub source_field: String,
    pub target_field: String,
    pub load_timeout: Duration,
    pub request_timeout: Duration,
}

impl IndexSettings {
    /// Credentials are required for any retrieval mode; Default mode works without them.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.uri.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err(ConfigError::MissingIndexUri);
        }
        if self.token.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err(ConfigError::MissingIndexToken);
        }
        Ok(())
    }
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            uri: None,
            token: None,
            collection: DEFAULT_COLLECTION.to_string(),
            anns_field: "embedding".to_string(),
            metric_type: "COSINE".to_string(),
            search_level: 2,
            source_field: "francais".to_string(),
            target_field: "breton".to_string(),
            load_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderApi {
    Ollama,
    OpenAi,
}

impl EncoderApi {
    pub fn parse(s: Option<&str>) -> Result<Self, ConfigError> {
        match s.unwrap_or("ollama").trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" | "openai-compatible" => Ok(Self::OpenAi),
            other => Err(ConfigError::Invalid {
                key: "encoder.api",
                message: format!("expected \"ollama\" or \"openai\", got {other:?}"),
            }),
        }
    }

    fn default_endpoint(self) -> &'static str {
        match self {
            Self::Ollama => "http://localhost:11434/api/embed",
            Self::OpenAi => "http://localhost:8080/v1/embeddings",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EncoderSettings {
    pub api: EncoderApi,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationLimits {
    pub max_input_tokens: usize,
    pub max_output_tokens: usize,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_input_tokens: 512,
            max_output_tokens: 150,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackendSettings {
    pub id: BackendId,
    pub model: String,
    pub path: Option<PathBuf>,
    pub endpoint: String,
    pub target_marker: Option<String>,
    pub template_hint: Option<String>,
    pub ctx_size: u32,
    pub threads: i32,
    pub gpu_layers: i32,
    pub timeout: Duration,
}

impl BackendSettings {
    pub fn defaults_for(id: BackendId) -> Self {
        Self {
            id,
            model: id.default_model().to_string(),
            path: None,
            endpoint: "http://localhost:11434".to_string(),
            target_marker: id.default_target_marker().map(|s| s.to_string()),
            template_hint: None,
            ctx_size: 4096,
            threads: -1,
            gpu_layers: -1,
            timeout: Duration::from_secs(120),
        }
    }

    fn apply(mut self, section: &BackendSection, config_dir: &Path) -> Self {
        if let Some(m) = non_empty(section.model.as_deref()) {
            self.model = m;
        }
        if let Some(p) = section.path.as_ref() {
            self.path = Some(if p.is_relative() {
                config_dir.join(p)
            } else {
                p.clone()
            });
        }
        if let Some(e) = non_empty(section.endpoint.as_deref()) {
            self.endpoint = e;
        }
        if let Some(marker) = section.target_marker.as_deref() {
            // An explicit empty marker turns forcing off.
            self.target_marker = non_empty(Some(marker));
        }
        self.template_hint = non_empty(section.template_hint.as_deref());
        self.ctx_size = section.ctx_size.unwrap_or(self.ctx_size);
        self.threads = section.threads.unwrap_or(self.threads);
        self.gpu_layers = section.gpu_layers.unwrap_or(self.gpu_layers);
        if let Some(secs) = section.timeout_secs {
            self.timeout = Duration::from_secs(secs);
        }
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug)]
pub struct TraceSettings {
    pub enabled: bool,
    pub dir: PathBuf,
}

/// Fully resolved settings used to build the translation context.
#[derive(Clone, Debug)]
pub struct Settings {
    pub config_path: PathBuf,
    pub index: IndexSettings,
    pub encoder: EncoderSettings,
    pub max_k: usize,
    pub limits: GenerationLimits,
    pub backends: Vec<BackendSettings>,
    pub logging: LoggingSettings,
    pub trace: TraceSettings,
    /// Problems found while resolving, reported once logging is up.
    pub warnings: Vec<String>,
}

impl Settings {
    /// Resolve a config file (if any) plus environment overrides.
    pub fn load(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        let cfg_file = explicit
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .or_else(|| find_default_config(DEFAULT_CONFIG_FILENAME));

        let mut file_cfg = AppConfig::default();
        if let Some(p) = cfg_file.as_ref() {
            if p.exists() {
                file_cfg = load_config(p)?;
            }
        }
        let cfg_path = cfg_file.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
        let env = EnvOverrides::from_process();
        Self::resolve(&file_cfg, &cfg_path, &env).context("resolve config")
    }

    pub fn resolve(
        file_cfg: &AppConfig,
        config_path: &Path,
        env: &EnvOverrides,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

        let idx = &file_cfg.index;
        let defaults = IndexSettings::default();
        let index = IndexSettings {
            uri: non_empty(env.index_uri.as_deref()).or_else(|| non_empty(idx.uri.as_deref())),
            token: non_empty(env.index_token.as_deref())
                .or_else(|| non_empty(idx.token.as_deref())),
            collection: non_empty(idx.collection.as_deref()).unwrap_or(defaults.collection),
            anns_field: non_empty(idx.anns_field.as_deref()).unwrap_or(defaults.anns_field),
            metric_type: non_empty(idx.metric_type.as_deref())
                .map(|s| s.to_ascii_uppercase())
                .unwrap_or(defaults.metric_type),
            search_level: idx.search_level.unwrap_or(defaults.search_level),
            source_field: non_empty(idx.source_field.as_deref()).unwrap_or(defaults.source_field),
            target_field: non_empty(idx.target_field.as_deref()).unwrap_or(defaults.target_field),
            load_timeout: idx
                .load_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.load_timeout),
            request_timeout: idx
                .request_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
        };

        let enc = &file_cfg.encoder;
        let api = EncoderApi::parse(enc.api.as_deref())?;
        let encoder = EncoderSettings {
            api,
            endpoint: non_empty(enc.endpoint.as_deref())
                .unwrap_or_else(|| api.default_endpoint().to_string()),
            model: non_empty(enc.model.as_deref())
                .unwrap_or_else(|| DEFAULT_ENCODER_MODEL.to_string()),
            api_key: non_empty(enc.api_key.as_deref()),
            timeout: Duration::from_secs(enc.timeout_secs.unwrap_or(30)),
        };

        let default_limits = GenerationLimits::default();
        let limits = GenerationLimits {
            max_input_tokens: file_cfg
                .generation
                .max_input_tokens
                .unwrap_or(default_limits.max_input_tokens),
            max_output_tokens: file_cfg
                .generation
                .max_output_tokens
                .unwrap_or(default_limits.max_output_tokens),
        };
        if limits.max_input_tokens == 0 || limits.max_output_tokens == 0 {
            return Err(ConfigError::Invalid {
                key: "generation",
                message: "token limits must be positive".to_string(),
            });
        }

        let mut backends = Vec::new();
        for id in BackendId::ALL {
            let base = BackendSettings::defaults_for(id);
            let resolved = match file_cfg.backends.get(id.as_str()) {
                Some(section) => base.apply(section, config_dir),
                None => base,
            };
            backends.push(resolved);
        }
        let mut warnings = Vec::new();
        let mut unknown: Vec<&String> = file_cfg
            .backends
            .keys()
            .filter(|name| name.parse::<BackendId>().is_err())
            .collect();
        unknown.sort();
        for name in unknown {
            warnings.push(format!("ignoring config for unknown backend '{name}'"));
        }

        let logging = LoggingSettings {
            level: non_empty(file_cfg.logging.level.as_deref())
                .unwrap_or_else(|| "info".to_string()),
            format: match file_cfg
                .logging
                .format
                .as_deref()
                .unwrap_or("text")
                .trim()
                .to_ascii_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Text,
            },
        };

        let trace_dir = non_empty(file_cfg.trace.dir.as_deref()).unwrap_or_else(|| "_trace".into());
        let trace_dir = if Path::new(&trace_dir).is_absolute() {
            PathBuf::from(trace_dir)
        } else {
            config_dir.join(trace_dir)
        };

        Ok(Self {
            config_path: config_path.to_path_buf(),
            index,
            encoder,
            max_k: file_cfg.retrieval.max_k.unwrap_or(30),
            limits,
            backends,
            logging,
            trace: TraceSettings {
                enabled: file_cfg.trace.enabled.unwrap_or(false),
                dir: trace_dir,
            },
            warnings,
        })
    }

    pub fn backend(&self, id: BackendId) -> Option<&BackendSettings> {
        self.backends.iter().find(|b| b.id == id)
    }
}

/// Environment values that override the config file.
#[derive(Clone, Debug, Default)]
pub struct EnvOverrides {
    pub index_uri: Option<String>,
    pub index_token: Option<String>,
}

impl EnvOverrides {
    pub fn from_process() -> Self {
        Self {
            index_uri: std::env::var(INDEX_URI_ENV).ok(),
            index_token: std::env::var(INDEX_TOKEN_ENV).ok(),
        }
    }
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}

/// Write the default config into `dir`. Existing files are kept unless `force`.
pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(DEFAULT_CONFIG_FILENAME);
    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}

pub const DEFAULT_CONFIG_TOML: &str = r#"# Credentials may also come from ZILLIZ_URI / ZILLIZ_TOKEN.
# Without them only the default (no examples) mode is available.
[index]
# uri = "https://<cluster>.cloud.zilliz.com"
# token = "<api key>"
collection = "traductions_francais_breton"
anns_field = "embedding"
metric_type = "COSINE"
search_level = 2
source_field = "francais"
target_field = "breton"
load_timeout_secs = 60
request_timeout_secs = 30

[encoder]
api = "ollama"
endpoint = "http://localhost:11434/api/embed"
model = "paraphrase-multilingual-mpnet-base-v2"
timeout_secs = 30

[retrieval]
max_k = 30

[generation]
max_input_tokens = 512
max_output_tokens = 150

[backends.nllb]
model = "facebook/nllb-200-distilled-600M"
target_marker = "bre_Latn"
# Local model file, used when built with --features native.
# path = "models/nllb-200-distilled-600M.gguf"

[backends.helsinki]
model = "Helsinki-NLP/opus-mt-fr-en"
# path = "models/opus-mt-fr-en.gguf"

[backends.llama]
model = "llama3"
endpoint = "http://localhost:11434"
timeout_secs = 120

[logging]
level = "info"
format = "text"

[trace]
enabled = false
dir = "_trace"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(toml_text: &str, env: EnvOverrides) -> Settings {
        let cfg: AppConfig = toml::from_str(toml_text).expect("parse toml");
        Settings::resolve(&cfg, Path::new("/etc/bt/breton-translator.toml"), &env)
            .expect("resolve")
    }

    #[test]
    fn defaults_match_original_deployment() {
        let s = resolve("", EnvOverrides::default());
        assert_eq!(s.index.collection, "traductions_francais_breton");
        assert_eq!(s.index.load_timeout, Duration::from_secs(60));
        assert_eq!(s.limits, GenerationLimits::default());
        assert_eq!(s.max_k, 30);
        let nllb = s.backend(BackendId::Nllb).expect("nllb");
        assert_eq!(nllb.target_marker.as_deref(), Some("bre_Latn"));
        assert_eq!(s.backend(BackendId::Helsinki).expect("helsinki").target_marker, None);
        assert!(!s.trace.enabled);
        assert_eq!(s.trace.dir, PathBuf::from("/etc/bt/_trace"));
    }

    #[test]
    fn env_overrides_file_credentials() {
        let s = resolve(
            "[index]\nuri = \"https://file\"\ntoken = \"file-token\"\n",
            EnvOverrides {
                index_uri: Some("https://env".to_string()),
                index_token: Some("  ".to_string()),
            },
        );
        assert_eq!(s.index.uri.as_deref(), Some("https://env"));
        // Blank env values do not clobber the file.
        assert_eq!(s.index.token.as_deref(), Some("file-token"));
        assert!(s.index.check().is_ok());
    }

    #[test]
    fn missing_credentials_fail_check() {
        let s = resolve("", EnvOverrides::default());
        assert!(matches!(s.index.check(), Err(ConfigError::MissingIndexUri)));
        let s = resolve("[index]\nuri = \"https://x\"\n", EnvOverrides::default());
        assert!(matches!(s.index.check(), Err(ConfigError::MissingIndexToken)));
    }

    #[test]
    fn backend_sections_are_applied() {
        let s = resolve(
            r#"
[backends.nllb]
path = "models/nllb.gguf"
target_marker = ""

[backends.llama]
model = "llama3.1:8b"
endpoint = "http://gpu-box:11434"
"#,
            EnvOverrides::default(),
        );
        let nllb = s.backend(BackendId::Nllb).expect("nllb");
        assert_eq!(nllb.path, Some(PathBuf::from("/etc/bt/models/nllb.gguf")));
        assert_eq!(nllb.target_marker, None);
        let llama = s.backend(BackendId::Llama).expect("llama");
        assert_eq!(llama.model, "llama3.1:8b");
        assert_eq!(llama.endpoint, "http://gpu-box:11434");
    }

    #[test]
    fn unknown_backend_sections_are_reported() {
        let s = resolve("[backends.gpt]\nmodel = \"x\"\n", EnvOverrides::default());
        assert_eq!(s.warnings, vec!["ignoring config for unknown backend 'gpt'".to_string()]);
        assert!(resolve("", EnvOverrides::default()).warnings.is_empty());
    }

    #[test]
    fn rejects_unknown_encoder_api() {
        let cfg: AppConfig = toml::from_str("[encoder]\napi = \"grpc\"\n").expect("parse");
        let err = Settings::resolve(&cfg, Path::new("x.toml"), &EnvOverrides::default())
            .expect_err("bad api");
        assert!(err.to_string().contains("encoder.api"));
    }

    #[test]
    fn default_config_file_parses() {
        let cfg: AppConfig = toml::from_str(DEFAULT_CONFIG_TOML).expect("parse default config");
        assert_eq!(cfg.backends.len(), 3);
        let s = Settings::resolve(&cfg, Path::new("x.toml"), &EnvOverrides::default())
            .expect("resolve");
        assert_eq!(s.backend(BackendId::Llama).expect("llama").model, "llama3");
    }

    #[test]
    fn init_default_config_respects_force() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = init_default_config(dir.path(), false).expect("init");
        std::fs::write(&path, "# edited").expect("edit");
        init_default_config(dir.path(), false).expect("init again");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "# edited");
        init_default_config(dir.path(), true).expect("force");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            DEFAULT_CONFIG_TOML
        );
    }

    #[test]
    fn find_file_upwards_walks_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILENAME), "").expect("write");
        let found = find_file_upwards(&nested, DEFAULT_CONFIG_FILENAME, 4).expect("found");
        assert_eq!(found, dir.path().join(DEFAULT_CONFIG_FILENAME));
        assert!(find_file_upwards(&nested, "nope.toml", 1).is_none());
    }
}
