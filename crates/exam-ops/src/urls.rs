//! Local vs hosted URL discovery.

use std::fmt;

use crate::cache::DEFAULT_PORT;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Local,
    Hosted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppUrls {
    pub local: String,
    pub hosted: Option<String>,
    pub serving: Environment,
}

/// `EXAM_ENV=hosted` marks the hosted deployment; everything else is local
pub fn resolve(var: impl Fn(&str) -> Option<String>) -> AppUrls {
    let port = var("BIND_ADDR")
        .and_then(|addr| addr.rsplit(':').next().and_then(|p| p.trim().parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);

    let hosted = var("PUBLIC_BASE_URL")
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty());

    let serving = match var("EXAM_ENV") {
        Some(env) if env.trim().eq_ignore_ascii_case("hosted") && hosted.is_some() => {
            Environment::Hosted
        }
        _ => Environment::Local,
    };

    AppUrls {
        local: format!("http://localhost:{port}"),
        hosted,
        serving,
    }
}

impl fmt::Display for AppUrls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |env: Environment| if self.serving == env { " (this environment)" } else { "" };

        writeln!(f, "Local:  {}{}", self.local, mark(Environment::Local))?;
        match &self.hosted {
            Some(url) => writeln!(f, "Hosted: {}{}", url, mark(Environment::Hosted)),
            None => writeln!(f, "Hosted: not configured (set PUBLIC_BASE_URL)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_to_local_port() {
        let urls = resolve(vars(&[]));
        assert_eq!(urls.local, "http://localhost:8501");
        assert_eq!(urls.hosted, None);
        assert_eq!(urls.serving, Environment::Local);
        assert!(urls.to_string().contains("not configured"));
    }

    #[test]
    fn test_hosted_environment_marked() {
        let urls = resolve(vars(&[
            ("BIND_ADDR", "0.0.0.0:9000"),
            ("PUBLIC_BASE_URL", "https://exams.example.com/"),
            ("EXAM_ENV", "Hosted"),
        ]));
        assert_eq!(urls.local, "http://localhost:9000");
        assert_eq!(urls.serving, Environment::Hosted);

        let rendered = urls.to_string();
        assert!(rendered.contains("Hosted: https://exams.example.com (this environment)"));
        assert!(!rendered.contains("9000 (this environment)"));
    }

    #[test]
    fn test_hosted_flag_without_url_stays_local() {
        let urls = resolve(vars(&[("EXAM_ENV", "hosted")]));
        assert_eq!(urls.serving, Environment::Local);
    }
}
