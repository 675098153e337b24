use crate::llm::{DEFAULT_ENDPOINT, DEFAULT_MODEL};

/**
 * \brief 运行配置：默认值 → 已保存的设置 → 环境变量 → 命令行参数，逐层覆盖。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuddyConfig {
    /** \brief Chat Completions 地址 */
    pub endpoint: String,
    /** \brief 模型名 */
    pub model: String,
}

impl Default for BuddyConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl BuddyConfig {
    /**
     * \brief 读取 `ASKMEBUDDY_ENDPOINT` / `ASKMEBUDDY_MODEL`。
     * \param stored_model app_config 中保存的模型，优先级低于环境变量
     */
    pub fn from_env(stored_model: Option<String>) -> Self {
        Self::from_lookup(stored_model, |name| std::env::var(name).ok())
    }

    fn from_lookup(
        stored_model: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let defaults = Self::default();
        let non_blank = |v: &String| !v.trim().is_empty();
        Self {
            endpoint: lookup("ASKMEBUDDY_ENDPOINT")
                .filter(non_blank)
                .unwrap_or(defaults.endpoint),
            model: lookup("ASKMEBUDDY_MODEL")
                .filter(non_blank)
                .or(stored_model.filter(non_blank))
                .unwrap_or(defaults.model),
        }
    }

    /**
     * \brief 用显式参数覆盖已有配置（None 表示保留）。
     */
    pub fn with_overrides(mut self, endpoint: Option<String>, model: Option<String>) -> Self {
        if let Some(endpoint) = endpoint {
            self.endpoint = endpoint;
        }
        if let Some(model) = model {
            self.model = model;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = BuddyConfig::from_lookup(None, |_| None);
        assert_eq!(cfg.endpoint, "https://api.openai.com/v1/chat/completions");
        assert_eq!(cfg.model, "gpt-3.5-turbo");
    }

    #[test]
    fn test_env_then_overrides() {
        let cfg = BuddyConfig::from_lookup(Some("gpt-stored".into()), |name| match name {
            "ASKMEBUDDY_MODEL" => Some("gpt-4o-mini".to_string()),
            "ASKMEBUDDY_ENDPOINT" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(cfg.model, "gpt-4o-mini");
        assert_eq!(cfg.endpoint, DEFAULT_ENDPOINT);

        let cfg = cfg.with_overrides(Some("http://127.0.0.1:9/v1/chat/completions".into()), None);
        assert_eq!(cfg.endpoint, "http://127.0.0.1:9/v1/chat/completions");
        assert_eq!(cfg.model, "gpt-4o-mini");
    }

    #[test]
    fn test_stored_model_sits_below_env() {
        let cfg = BuddyConfig::from_lookup(Some("gpt-stored".into()), |_| None);
        assert_eq!(cfg.model, "gpt-stored");

        let cfg = BuddyConfig::from_lookup(Some("gpt-stored".into()), |name| {
            (name == "ASKMEBUDDY_MODEL").then(|| "gpt-env".to_string())
        });
        assert_eq!(cfg.model, "gpt-env");

        let cfg = cfg.with_overrides(None, Some("gpt-flag".into()));
        assert_eq!(cfg.model, "gpt-flag");
    }
}
