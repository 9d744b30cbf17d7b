use std::collections::HashMap;
use std::sync::RwLock;

pub const DEFAULT_LANG: &str = "en-US";

type Catalog = HashMap<String, String>;

/// Namespaced message catalogs with language fallback and `__name__`
/// interpolation. Message keys are dotted paths flattened to strings.
pub struct I18n {
    default_lang: String,
    // lang -> namespace -> key -> message
    catalogs: RwLock<HashMap<String, HashMap<String, Catalog>>>,
}

impl Default for I18n {
    fn default() -> Self {
        Self::new(DEFAULT_LANG)
    }
}

impl std::fmt::Debug for I18n {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I18n").field("default_lang", &self.default_lang).finish()
    }
}

impl I18n {
    pub fn new(default_lang: &str) -> Self {
        I18n { default_lang: default_lang.to_string(), catalogs: RwLock::new(HashMap::new()) }
    }

    /// The runtime's own message catalog, used by the engine's lifecycle
    /// logging.
    pub fn with_runtime_catalog() -> Self {
        let i18n = Self::new(DEFAULT_LANG);
        i18n.register_catalog(
            DEFAULT_LANG,
            "runtime",
            HashMap::from([
                ("flows.started".to_string(), "Started flows".to_string()),
                ("flows.stopped".to_string(), "Stopped flows".to_string()),
                (
                    "flows.deployed".to_string(),
                    "Deployed flows: __added__ added, __removed__ removed, __changed__ changed".to_string(),
                ),
                ("flows.starting-flow".to_string(), "Starting flow: __id__".to_string()),
                ("flows.stopping-flow".to_string(), "Stopping flow: __id__".to_string()),
            ]),
        );
        i18n
    }

    pub fn register_catalog(&self, lang: &str, namespace: &str, messages: Catalog) {
        let mut catalogs = self.catalogs.write().expect("i18n lock");
        catalogs.entry(lang.to_string()).or_default().insert(namespace.to_string(), messages);
    }

    /// The fallback chain for a language: `zh-CN` → `zh` → default →
    /// default's base.
    fn fallback_chain(&self, lang: &str) -> Vec<String> {
        let mut chain = Vec::with_capacity(4);
        let mut push = |x: &str| {
            if !x.is_empty() && !chain.iter().any(|c: &String| c == x) {
                chain.push(x.to_string());
            }
        };
        push(lang);
        if let Some((base, _)) = lang.split_once('-') {
            push(base);
        }
        let default_lang = self.default_lang.as_str();
        push(default_lang);
        if let Some((base, _)) = default_lang.split_once('-') {
            push(base);
        }
        chain
    }

    fn lookup(&self, namespace: &str, key: &str, lang: &str) -> Option<String> {
        let catalogs = self.catalogs.read().expect("i18n lock");
        for lang in self.fallback_chain(lang) {
            if let Some(message) =
                catalogs.get(&lang).and_then(|namespaces| namespaces.get(namespace)).and_then(|cat| cat.get(key))
            {
                return Some(message.clone());
            }
        }
        None
    }

    /// Resolves a message and interpolates `__name__` placeholders from
    /// `args`. An unknown key resolves to the key itself.
    pub fn t(&self, namespace: &str, key: &str, lang: &str, args: &[(&str, &str)]) -> String {
        let template = self.lookup(namespace, key, lang).unwrap_or_else(|| key.to_string());
        interpolate(&template, args)
    }

    pub fn has_namespace(&self, lang: &str, namespace: &str) -> bool {
        let catalogs = self.catalogs.read().expect("i18n lock");
        self.fallback_chain(lang)
            .iter()
            .any(|l| catalogs.get(l).map(|namespaces| namespaces.contains_key(namespace)).unwrap_or(false))
    }
}

fn interpolate(template: &str, args: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in args {
        out = out.replace(&format!("__{}__", name), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_i18n() -> I18n {
        let i18n = I18n::new("en-US");
        i18n.register_catalog(
            "en-US",
            "runtime",
            HashMap::from([
                ("flows.started".to_string(), "Started flows".to_string()),
                ("flows.stopped-flow".to_string(), "Stopped flow __label__".to_string()),
            ]),
        );
        i18n.register_catalog(
            "de",
            "runtime",
            HashMap::from([("flows.started".to_string(), "Flows gestartet".to_string())]),
        );
        i18n
    }

    #[test]
    fn test_lookup_and_interpolation() {
        let i18n = make_i18n();
        assert_eq!(i18n.t("runtime", "flows.started", "en-US", &[]), "Started flows");
        assert_eq!(i18n.t("runtime", "flows.stopped-flow", "en-US", &[("label", "Flow 1")]), "Stopped flow Flow 1");
    }

    #[test]
    fn test_fallback_chain() {
        let i18n = make_i18n();
        // de-AT falls back to de
        assert_eq!(i18n.t("runtime", "flows.started", "de-AT", &[]), "Flows gestartet");
        // de lacks the key, falls back to the default language
        assert_eq!(i18n.t("runtime", "flows.stopped-flow", "de", &[("label", "F")]), "Stopped flow F");
        // unknown key resolves to itself
        assert_eq!(i18n.t("runtime", "no.such.key", "en-US", &[]), "no.such.key");
    }

    #[test]
    fn test_has_namespace() {
        let i18n = make_i18n();
        assert!(i18n.has_namespace("de-AT", "runtime"));
        assert!(!i18n.has_namespace("en-US", "editor"));
    }
}
