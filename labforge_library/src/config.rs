#[macro_export]
/// Load a configuration struct with compiled-in JSON defaults.
/// Values from the optional file, then the environment, then `overrides`, replace the defaults in that order.
/// The defaults path is relative to the workspace root.
///
/// # Example
/// ```
/// #[derive(serde::Deserialize)]
/// struct CustomConfig {
///
/// }
/// pub fn new(
///     config_fpath: Option<&str>,
///     overrides: Option<Vec<(String, String)>>,
/// ) -> anyhow::Result<CustomConfig> {
///     labforge_library::load_config_default!(
///             "labforge_engine/src/engine.json",
///             config_fpath,
///             overrides,
///             "LABFORGE_ENGINE"
///         )
/// }
/// ```
macro_rules! load_config_default {
    ($defaults_json_file:literal, $overrides_config_fpath:ident, $overrides:ident, $env_prefix:expr) => {{
        let defaults = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../", $defaults_json_file));
        $crate::config::load_config(Some(defaults), $overrides_config_fpath, $overrides, $env_prefix)
    }};
}

/// Build a configuration from layered sources.
/// Environment variables are read as `<env_prefix>__<section>__<key>`.
pub fn load_config<T>(
    default_json: Option<&str>,
    overrides_config_fpath: Option<&str>,
    overrides: Option<Vec<(String, String)>>,
    env_prefix: &str,
) -> anyhow::Result<T>
where
    T: for<'a> serde::Deserialize<'a>,
{
    let mut builder = config::Config::builder();
    if let Some(default_json) = default_json {
        builder = builder.add_source(config::File::from_str(default_json, config::FileFormat::Json));
    }
    if let Some(config_fpath) = overrides_config_fpath {
        if !std::path::Path::new(&config_fpath).exists() {
            anyhow::bail!("Configuration file '{}' does not exist", config_fpath);
        }
        builder = builder.add_source(config::File::with_name(config_fpath));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(env_prefix)
            .try_parsing(true)
            .separator("__")
            .prefix_separator("__"),
    );
    for (k, v) in overrides.unwrap_or_default() {
        builder = match builder.set_override(&k, v.clone()) {
            Ok(s) => s,
            Err(e) => anyhow::bail!("Failed to set override '{}' to '{}' because {}", k, v, e),
        };
    }
    match builder.build() {
        Ok(s) => match s.try_deserialize() {
            Ok(cfg) => Ok(cfg),
            Err(e) => anyhow::bail!("Failed to deserialize configuration because '{}'", e),
        },
        Err(e) => anyhow::bail!("Failed to build configuration because '{}'", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Deserialize)]
    struct Section {
        count: u32,
        name: String,
    }
    #[derive(serde::Deserialize)]
    struct Sample {
        section: Section,
    }

    const DEFAULTS: &str = r#"{ "section": { "count": 3, "name": "default" } }"#;

    #[test]
    fn defaults_load() {
        let s: Sample = load_config(Some(DEFAULTS), None, None, "LABFORGE_CFG_TEST_A").unwrap();
        assert_eq!(s.section.count, 3);
        assert_eq!(s.section.name, "default");
    }

    #[test]
    fn overrides_replace_defaults() {
        let overrides = vec![("section.count".to_string(), "10".to_string())];
        let s: Sample = load_config(Some(DEFAULTS), None, Some(overrides), "LABFORGE_CFG_TEST_B").unwrap();
        assert_eq!(s.section.count, 10);
        assert_eq!(s.section.name, "default");
    }

    #[test]
    fn missing_file_errors() {
        let r: anyhow::Result<Sample> = load_config(
            Some(DEFAULTS),
            Some("/this/path/does/not/exist.json"),
            None,
            "LABFORGE_CFG_TEST_C",
        );
        assert!(r.is_err());
    }
}
