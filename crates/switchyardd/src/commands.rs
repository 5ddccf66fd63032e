//! One-shot subcommands: config checking and scaffolding.

use std::fmt::Write;
use std::path::Path;

use anyhow::{bail, Context};

use switchyard_core::SwitchyardConfig;

/// Load and validate `path`, returning a human-readable summary.
pub fn check_config(path: &Path) -> anyhow::Result<String> {
    let config = SwitchyardConfig::from_file(path)
        .with_context(|| format!("invalid config {}", path.display()))?;

    let mut out = String::new();
    let _ = writeln!(out, "config ok: {}", path.display());
    let _ = writeln!(out, "initial active: {}", config.initial_active);
    for env in &config.environments {
        let _ = writeln!(
            out,
            "  {:<10} v{:<10} {}",
            env.id.to_string(),
            env.version,
            env.endpoints.join(", ")
        );
    }
    let _ = writeln!(out, "migration steps: {:?}", config.migration.steps);
    let _ = write!(out, "router: {:?}", config.router.kind);
    Ok(out)
}

/// Write a scaffolded two-environment config to `out`.
pub fn init_config(primary: &str, secondary: &str, out: &Path, force: bool) -> anyhow::Result<()> {
    if out.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", out.display());
    }
    let config = SwitchyardConfig::scaffold(primary, secondary);
    config.validate()?;
    std::fs::write(out, config.to_toml_string()?)
        .with_context(|| format!("write {}", out.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffolded_config_passes_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");

        init_config("10.0.0.1:8080", "10.0.0.2:8080", &path, false).unwrap();
        let summary = check_config(&path).unwrap();

        assert!(summary.contains("initial active: primary"));
        assert!(summary.contains("10.0.0.2:8080"));
        assert!(summary.contains("[25, 50, 75, 100]"));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");
        std::fs::write(&path, "# hand edited\n").unwrap();

        assert!(init_config("a:1", "b:1", &path, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# hand edited\n");

        init_config("a:1", "b:1", &path, true).unwrap();
        assert!(check_config(&path).is_ok());
    }

    #[test]
    fn check_rejects_bad_steps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");
        let mut config = SwitchyardConfig::scaffold("a:1", "b:1");
        config.migration.steps = vec![50, 25];
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        assert!(check_config(&path).is_err());
    }
}
