//! Configuração do autoapply carregada a partir de `autoapply.toml`.
//!
//! A struct [`AutoApplyConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! Variáveis de ambiente têm precedência sobre o arquivo para segredos:
//! `ANTHROPIC_API_KEY` e `AUTOAPPLY_<PLATAFORMA>_PASSWORD`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::behavior::BehaviorConfig;
use crate::error::AutoApplyError;
use crate::gateway::CandidateProfile;
use crate::matching::MatchingConfig;
use crate::platform::{AdapterKind, PlatformId, SearchCriteria};
use crate::rate_limit::{BucketConfig, PlatformBudget};
use crate::session::SessionLimits;
use crate::state_machine::{RetryConfig, TaskLimits};

/// Caminho padrão do arquivo de configuração.
pub const DEFAULT_CONFIG_PATH: &str = "autoapply.toml";

/// Uma candidatura completa gasta três requisições numa sessão nova:
/// login, detalhe da vaga e envio.
pub const MIN_SESSION_REQUESTS: u32 = 3;

/// Configuração de nível superior carregada de `autoapply.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoApplyConfig {
    /// Política de retentativa e backoff.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Resposta a sinais de detecção de automação.
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Limites de obsolescência das sessões e proxies.
    #[serde(default)]
    pub session: SessionConfig,

    /// Distribuições de tempo do simulador de comportamento.
    #[serde(default)]
    pub behavior: BehaviorConfig,

    /// Orçamento global compartilhado por todas as plataformas.
    #[serde(default)]
    pub global: GlobalConfig,

    /// Critérios de adequação das vagas.
    #[serde(default)]
    pub matching: MatchingConfig,

    /// Perfil do candidato usado na geração de conteúdo.
    #[serde(default)]
    pub profile: CandidateProfile,

    /// Gateway de geração de conteúdo.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Destino dos registros de resultado.
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Tempo máximo de vida de uma tarefa, em segundos.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Plataformas configuradas, indexadas pelo nome.
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

/// Configuração de uma plataforma de vagas.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Plataformas desabilitadas ficam fora do conjunto de workers.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Implementação do adaptador.
    #[serde(default)]
    pub kind: AdapterKind,

    /// URL base da API (obrigatória para `board`).
    #[serde(default)]
    pub base_url: Option<String>,

    /// Máximo de sessões simultâneas.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Tokens por janela do bucket da plataforma.
    #[serde(default = "default_platform_tokens")]
    pub tokens_per_window: u32,

    /// Tamanho da janela do bucket, em segundos.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Limite diário de candidaturas enviadas.
    #[serde(default = "default_platform_daily_cap")]
    pub daily_submission_cap: u32,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Critérios da busca feita ao iniciar o worker.
    #[serde(default)]
    pub search: Option<SearchCriteria>,

    /// Vagas geradas pelo adaptador `scripted`.
    #[serde(default = "default_scripted_listings")]
    pub scripted_listings: usize,
}

/// Cool-down da plataforma e limite de detecções por tarefa.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Cool-down após a primeira detecção, em segundos.
    #[serde(default = "default_cooldown_base_secs")]
    pub cooldown_base_secs: u64,

    /// Teto do cool-down, em segundos.
    #[serde(default = "default_cooldown_ceiling_secs")]
    pub cooldown_ceiling_secs: u64,

    /// Detecções toleradas por tarefa antes da falha fatal.
    #[serde(default = "default_max_detections_per_task")]
    pub max_detections_per_task: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Requisições por sessão antes do descarte.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Idade máxima da sessão, em segundos.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Espera máxima por uma vaga de sessão, em segundos.
    #[serde(default = "default_checkout_timeout_secs")]
    pub checkout_timeout_secs: u64,

    /// Proxies usados em rodízio. Vazio significa conexão direta.
    #[serde(default)]
    pub proxies: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_global_tokens")]
    pub tokens_per_window: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Limite diário somado de todas as plataformas.
    #[serde(default = "default_global_daily_cap")]
    pub daily_submission_cap: u32,
}

/// Implementação do gateway de conteúdo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    /// Textos montados localmente a partir do perfil.
    #[default]
    Template,
    /// API de mensagens da Anthropic.
    Llm,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub kind: GatewayKind,

    /// Chave da API Anthropic.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Timeout de cada requisição ao provedor, em segundos.
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Arquivo JSONL onde cada resultado é anexado.
    #[serde(default = "default_tracking_path")]
    pub path: String,
}

fn default_enabled() -> bool {
    true
}

fn default_concurrency() -> usize {
    2
}

fn default_platform_tokens() -> u32 {
    10
}

// Janela padrão dos buckets: 60s.
fn default_window_secs() -> u64 {
    60
}

fn default_platform_daily_cap() -> u32 {
    25
}

fn default_scripted_listings() -> usize {
    20
}

fn default_cooldown_base_secs() -> u64 {
    60
}

// Teto do cool-down: 30 minutos.
fn default_cooldown_ceiling_secs() -> u64 {
    1_800
}

fn default_max_detections_per_task() -> u32 {
    2
}

fn default_max_requests() -> u32 {
    50
}

fn default_max_age_secs() -> u64 {
    1_800
}

fn default_checkout_timeout_secs() -> u64 {
    30
}

fn default_global_tokens() -> u32 {
    30
}

fn default_global_daily_cap() -> u32 {
    60
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    120
}

fn default_tracking_path() -> String {
    "autoapply-outcomes.jsonl".to_string()
}

fn default_task_timeout_secs() -> u64 {
    3_600
}

impl Default for AutoApplyConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            detection: DetectionConfig::default(),
            session: SessionConfig::default(),
            behavior: BehaviorConfig::default(),
            global: GlobalConfig::default(),
            matching: MatchingConfig::default(),
            profile: CandidateProfile::default(),
            gateway: GatewayConfig::default(),
            tracking: TrackingConfig::default(),
            task_timeout_secs: default_task_timeout_secs(),
            platforms: BTreeMap::new(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            kind: AdapterKind::default(),
            base_url: None,
            concurrency: default_concurrency(),
            tokens_per_window: default_platform_tokens(),
            window_secs: default_window_secs(),
            daily_submission_cap: default_platform_daily_cap(),
            username: String::new(),
            password: String::new(),
            search: None,
            scripted_listings: default_scripted_listings(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            cooldown_base_secs: default_cooldown_base_secs(),
            cooldown_ceiling_secs: default_cooldown_ceiling_secs(),
            max_detections_per_task: default_max_detections_per_task(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            max_age_secs: default_max_age_secs(),
            checkout_timeout_secs: default_checkout_timeout_secs(),
            proxies: Vec::new(),
        }
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            tokens_per_window: default_global_tokens(),
            window_secs: default_window_secs(),
            daily_submission_cap: default_global_daily_cap(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            kind: GatewayKind::default(),
            api_key: String::new(),
            model: default_model(),
            timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            path: default_tracking_path(),
        }
    }
}

impl PlatformConfig {
    /// Orçamento de tokens e limite diário desta plataforma.
    pub fn budget(&self) -> PlatformBudget {
        PlatformBudget {
            bucket: BucketConfig {
                capacity: self.tokens_per_window,
                window: Duration::from_secs(self.window_secs),
            },
            daily_submission_cap: self.daily_submission_cap,
        }
    }
}

impl AutoApplyConfig {
    /// Carrega a configuração de `path` (ou de `autoapply.toml` no diretório atual).
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<AutoApplyConfig>(&contents).map_err(AutoApplyError::from)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Aplica segredos vindos do ambiente. `lookup` devolve o valor de uma variável.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Variável de ambiente tem precedência sobre o arquivo para a chave API.
        if let Some(key) = lookup("ANTHROPIC_API_KEY").filter(|k| !k.is_empty()) {
            self.gateway.api_key = key;
        }
        for (name, platform) in &mut self.platforms {
            if let Some(password) = lookup(&password_var(name)).filter(|p| !p.is_empty()) {
                platform.password = password;
            }
        }
    }

    /// Plataformas habilitadas, em ordem de nome.
    pub fn enabled_platforms(&self) -> impl Iterator<Item = (&String, &PlatformConfig)> {
        self.platforms.iter().filter(|(_, p)| p.enabled)
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_requests: self.session.max_requests,
            max_age: Duration::from_secs(self.session.max_age_secs),
        }
    }

    pub fn task_limits(&self) -> TaskLimits {
        TaskLimits {
            max_retries: self.retry.max_retries,
            max_detections: self.detection.max_detections_per_task,
        }
    }

    pub fn global_bucket(&self) -> BucketConfig {
        BucketConfig {
            capacity: self.global.tokens_per_window,
            window: Duration::from_secs(self.global.window_secs),
        }
    }

    pub fn platform_budgets(&self) -> impl Iterator<Item = (PlatformId, PlatformBudget)> + '_ {
        self.enabled_platforms()
            .map(|(name, p)| (PlatformId::new(name.as_str()), p.budget()))
    }

    /// Rejeita capacidades zeradas, limites invertidos e thresholds fora de `[0, 1]`.
    pub fn validate(&self) -> Result<(), AutoApplyError> {
        let fail = |msg: String| Err(AutoApplyError::Config(msg));

        if !(0.0..=1.0).contains(&self.matching.threshold) {
            return fail(format!(
                "matching.threshold must be within [0, 1], got {}",
                self.matching.threshold
            ));
        }
        if self.retry.base_delay_ms > self.retry.ceiling_delay_ms {
            return fail("retry.base_delay_ms exceeds retry.ceiling_delay_ms".into());
        }
        if self.detection.cooldown_base_secs > self.detection.cooldown_ceiling_secs {
            return fail(
                "detection.cooldown_base_secs exceeds detection.cooldown_ceiling_secs".into(),
            );
        }
        if self.session.max_requests < MIN_SESSION_REQUESTS {
            return fail(format!(
                "session.max_requests must be at least {MIN_SESSION_REQUESTS}, got {}",
                self.session.max_requests
            ));
        }
        if self.session.max_age_secs == 0 {
            return fail("session.max_age_secs must be positive".into());
        }
        if self.global.tokens_per_window == 0 || self.global.window_secs == 0 {
            return fail("global rate budget must be positive".into());
        }
        if self.global.daily_submission_cap == 0 {
            return fail("global.daily_submission_cap must be positive".into());
        }
        if self.task_timeout_secs == 0 {
            return fail("task_timeout_secs must be positive".into());
        }
        if let Err(msg) = self.behavior.validate() {
            return fail(format!("behavior: {msg}"));
        }
        for (name, p) in self.enabled_platforms() {
            if p.concurrency == 0 {
                return fail(format!("platform {name}: concurrency must be positive"));
            }
            if p.tokens_per_window == 0 || p.window_secs == 0 {
                return fail(format!("platform {name}: rate budget must be positive"));
            }
            if p.daily_submission_cap == 0 {
                return fail(format!("platform {name}: daily_submission_cap must be positive"));
            }
        }
        Ok(())
    }

    /// Configuração da demonstração: duas plataformas simuladas, sem pausas
    /// de comportamento e com o gateway de templates.
    pub fn demo() -> Self {
        let mut config = Self {
            behavior: BehaviorConfig::instant(),
            profile: CandidateProfile {
                name: "Ada Lovelace".into(),
                email: "ada@example.com".into(),
                headline: "Backend engineer".into(),
                skills: vec!["rust".into(), "backend".into(), "tokio".into()],
                years_experience: 6,
                ..Default::default()
            },
            ..Self::default()
        };
        config.matching.threshold = 0.4;
        config.global.tokens_per_window = 200;
        for (name, listings) in [("alpha", 12), ("beta", 8)] {
            config.platforms.insert(
                name.to_string(),
                PlatformConfig {
                    kind: AdapterKind::Scripted,
                    username: "ada".into(),
                    password: "demo".into(),
                    scripted_listings: listings,
                    tokens_per_window: 60,
                    search: Some(SearchCriteria {
                        keywords: "rust".into(),
                        location: String::new(),
                        max_pages: 5,
                    }),
                    ..Default::default()
                },
            );
        }
        config
    }
}

/// `AUTOAPPLY_<PLATAFORMA>_PASSWORD`, com o nome em maiúsculas.
fn password_var(platform: &str) -> String {
    let name: String = platform
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("AUTOAPPLY_{name}_PASSWORD")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"
        task_timeout_secs = 900

        [retry]
        max_retries = 5

        [global]
        daily_submission_cap = 40

        [matching]
        threshold = 0.6
        keywords = ["rust"]

        [profile]
        name = "Ada"
        skills = ["rust", "tokio"]

        [platforms.board]
        base_url = "https://jobs.example"
        concurrency = 3
        username = "ada"

        [platforms.board.search]
        keywords = "rust engineer"

        [platforms.sandbox]
        kind = "scripted"
        enabled = false
    "#;

    #[test]
    fn default_config_values() {
        let config = AutoApplyConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.detection.cooldown_base_secs, 60);
        assert_eq!(config.session.max_requests, 50);
        assert_eq!(config.gateway.kind, GatewayKind::Template);
        assert!(config.platforms.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let config: AutoApplyConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.task_timeout_secs, 900);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.global.daily_submission_cap, 40);
        assert_eq!(config.global.tokens_per_window, 30);
        assert_eq!(config.profile.skills.len(), 2);

        let board = &config.platforms["board"];
        assert!(board.enabled);
        assert_eq!(board.kind, AdapterKind::Board);
        assert_eq!(board.concurrency, 3);
        assert_eq!(board.tokens_per_window, 10);
        assert_eq!(board.search.as_ref().unwrap().max_pages, 5);

        let names: Vec<_> = config.enabled_platforms().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["board"]);
    }

    #[test]
    fn env_overrides_secrets() {
        let mut config: AutoApplyConfig = toml::from_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "sk-test-123"),
            ("AUTOAPPLY_BOARD_PASSWORD", "hunter2"),
        ]
        .into();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.gateway.api_key, "sk-test-123");
        assert_eq!(config.platforms["board"].password, "hunter2");
        assert!(config.platforms["sandbox"].password.is_empty());
    }

    #[test]
    fn password_var_normalises_platform_name() {
        assert_eq!(password_var("job-board"), "AUTOAPPLY_JOB_BOARD_PASSWORD");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = AutoApplyConfig::default();
        config.matching.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AutoApplyConfig::default();
        config.platforms.insert(
            "board".into(),
            PlatformConfig {
                concurrency: 0,
                ..Default::default()
            },
        );
        assert!(matches!(config.validate(), Err(AutoApplyError::Config(_))));

        let mut config = AutoApplyConfig::default();
        config.retry.base_delay_ms = 10_000;
        config.retry.ceiling_delay_ms = 1_000;
        assert!(config.validate().is_err());

        // Disabled platforms are not checked.
        let mut config = AutoApplyConfig::default();
        config.platforms.insert(
            "off".into(),
            PlatformConfig {
                enabled: false,
                daily_submission_cap: 0,
                ..Default::default()
            },
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_requires_room_for_one_application_per_session() {
        let mut config = AutoApplyConfig::default();
        config.session.max_requests = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("session.max_requests"));

        config.session.max_requests = MIN_SESSION_REQUESTS - 1;
        assert!(config.validate().is_err());

        config.session.max_requests = MIN_SESSION_REQUESTS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn demo_config_is_valid() {
        let config = AutoApplyConfig::demo();
        assert!(config.validate().is_ok());
        assert_eq!(config.enabled_platforms().count(), 2);
        assert!(config.platforms.values().all(|p| p.kind == AdapterKind::Scripted));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = AutoApplyConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.matching.threshold, 0.6);
        assert_eq!(config.platforms.len(), 2);
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AutoApplyConfig::load(Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[matching]\nthreshold = -1.0\n").unwrap();
        assert!(AutoApplyConfig::load(Some(file.path())).is_err());
    }
}
