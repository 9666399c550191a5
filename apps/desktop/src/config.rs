use std::{collections::HashMap, fs};

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub database_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            database_path: "./data/session.db".into(),
        }
    }
}

/// Defaults, overridden by `client.toml`, overridden by environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("database_path") {
                settings.database_path = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_DATABASE_PATH") {
        settings.database_path = v;
    }

    settings
}

pub fn database_url(database_path: &str) -> String {
    if database_path.starts_with("sqlite:") {
        return database_path.to_owned();
    }
    format!("sqlite://{}", database_path.replace('\\', "/"))
}
