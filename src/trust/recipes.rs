//! `ujust` recipe file exposing the MOK commands to the operator.

use anyhow::Result;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::host::{self, HostRoot};
use crate::pipeline::config::RecipesConfig;

const RECIPE_MODE: u32 = 0o644;

/// `<dir>/<prefix>-<module>-mok.just` under `host`.
pub fn recipe_file_path(host: &HostRoot, config: &RecipesConfig, module: &str) -> PathBuf {
    host.path(&config.dir)
        .join(format!("{}-{}-mok.just", config.prefix, module))
}

/// Recipe names in file order, paired with the `mok` subcommand they run.
pub fn recipe_names(module: &str) -> [(String, &'static str); 4] {
    [
        (format!("enroll-{}-key", module), "enroll"),
        (format!("check-{}-key", module), "check"),
        (format!("remove-{}-key", module), "remove"),
        (format!("test-{}-load", module), "test-load"),
    ]
}

pub fn render_recipes(module: &str, binary: &str) -> String {
    let descriptions = [
        format!("Enroll the {} signing certificate into the MOK database (confirm on next boot)", module),
        format!("Check whether the {} signing certificate is enrolled", module),
        format!("Remove the {} signing certificate from the MOK database (confirm on next boot)", module),
        format!("Reload the {} module and confirm it is loaded", module),
    ];

    let mut out = String::from("# Generated by kmod-provision; rewritten on every build.\n");
    for ((recipe, subcommand), description) in recipe_names(module).iter().zip(descriptions) {
        let _ = write!(
            out,
            "\n# {}\n{}:\n    sudo {} mok {}\n",
            description, recipe, binary, subcommand
        );
    }
    out
}

/// Write the recipe file; it is derived data and always overwritten.
pub fn write_recipes(host: &HostRoot, config: &RecipesConfig, module: &str) -> Result<PathBuf> {
    let path = recipe_file_path(host, config, module);
    host::write_file_mode(
        &path,
        render_recipes(module, &config.binary).as_bytes(),
        RECIPE_MODE,
    )?;
    log::info!("recipes: wrote {}", path.display());
    Ok(path)
}
