//! Out-of-tree module compilation.
//!
//! The single-file source is staged into a scratch directory next to a
//! one-line kbuild `Makefile`, then the kernel's own build system is invoked:
//!
//! ```text
//! <work_dir>/hp-wmi-build/
//!   Makefile      obj-m += hp-wmi.o
//!   hp-wmi.c      copied source
//!   hp-wmi.ko     produced by make -C <build_dir> M=<scratch> modules
//! ```

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::build::kernel::KernelTarget;
use crate::host::list_dir_names;
use crate::process::{ensure_exists, Cmd, CommandRunner};

/// Scratch directory plus the compiled object inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleArtifact {
    pub source: PathBuf,
    pub scratch_dir: PathBuf,
    pub object: PathBuf,
}

impl ModuleArtifact {
    /// Remove the scratch directory. Only the installed copy persists.
    pub fn discard(&self) -> Result<()> {
        if self.scratch_dir.exists() {
            fs::remove_dir_all(&self.scratch_dir).with_context(|| {
                format!("removing build directory '{}'", self.scratch_dir.display())
            })?;
        }
        Ok(())
    }
}

/// kbuild makefile for a single-object module.
pub fn kbuild_makefile(module: &str) -> String {
    format!("obj-m += {}.o\n", module)
}

pub fn make_jobs() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(e) => {
            log::warn!("build: could not detect CPU count ({}), using 4 jobs", e);
            4
        }
    }
}

/// Fail unless the module source is staged at `source`.
pub fn check_source(name: &str, source: &Path) -> Result<()> {
    ensure_exists(source, &format!("{} module source", name))
}

/// Compile `source` as module `name` against `target`.
///
/// The scratch directory is recreated from nothing on every run so stale
/// objects from an earlier attempt are never picked up.
pub fn build_module(
    runner: &dyn CommandRunner,
    target: &KernelTarget,
    name: &str,
    source: &Path,
    scratch_dir: &Path,
) -> Result<ModuleArtifact> {
    check_source(name, source)?;

    if scratch_dir.exists() {
        fs::remove_dir_all(scratch_dir)
            .with_context(|| format!("clearing build directory '{}'", scratch_dir.display()))?;
    }
    fs::create_dir_all(scratch_dir)
        .with_context(|| format!("creating build directory '{}'", scratch_dir.display()))?;

    let staged = scratch_dir.join(format!("{}.c", name));
    fs::copy(source, &staged).with_context(|| {
        format!(
            "copying module source '{}' to '{}'",
            source.display(),
            staged.display()
        )
    })?;
    fs::write(scratch_dir.join("Makefile"), kbuild_makefile(name))
        .with_context(|| format!("writing Makefile in '{}'", scratch_dir.display()))?;

    log::info!(
        "build: compiling {} against {} ({})",
        name,
        target.version,
        target.build_dir.display()
    );
    let result = Cmd::new("make")
        .arg("-C")
        .arg_path(&target.build_dir)
        .arg(format!("M={}", scratch_dir.display()))
        .arg(format!("-j{}", make_jobs()))
        .arg("modules")
        .current_dir(scratch_dir)
        .allow_fail()
        .run(runner)?;

    let object = scratch_dir.join(format!("{}.ko", name));
    if !result.success() || !object.is_file() {
        let status = match result.code {
            Some(0) => format!("make succeeded but produced no {}.ko", name),
            Some(code) => format!("make exited with code {}", code),
            None => "make was terminated by a signal".to_string(),
        };
        let output = result.combined_output();
        bail!(
            "building module {} failed: {}\nBuild directory {} contains:\n  {}{}",
            name,
            status,
            scratch_dir.display(),
            list_dir_names(scratch_dir).join("\n  "),
            if output.is_empty() {
                String::new()
            } else {
                format!("\nmake output:\n{}", output)
            }
        );
    }

    log::info!("build: produced {}", object.display());
    Ok(ModuleArtifact {
        source: source.to_path_buf(),
        scratch_dir: scratch_dir.to_path_buf(),
        object,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{failed, make_handler, FakeRunner};
    use tempfile::TempDir;

    fn target(dir: &Path) -> KernelTarget {
        KernelTarget {
            version: "6.11.5-300.fc41.x86_64".to_string(),
            build_dir: dir.join("kernel"),
            exact: true,
        }
    }

    fn source(dir: &Path) -> PathBuf {
        let path = dir.join("src/hp-wmi.c");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "int init_module(void) { return 0; }\n").unwrap();
        path
    }

    #[test]
    fn test_makefile_contents() {
        assert_eq!(kbuild_makefile("hp-wmi"), "obj-m += hp-wmi.o\n");
    }

    #[test]
    fn test_build_produces_object() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new().on("make", make_handler());
        let scratch = temp.path().join("work/hp-wmi-build");

        let artifact =
            build_module(&runner, &target(temp.path()), "hp-wmi", &source(temp.path()), &scratch)
                .unwrap();

        assert_eq!(artifact.object, scratch.join("hp-wmi.ko"));
        assert!(fs::read(&artifact.object).unwrap().starts_with(b"\x7fELF"));
        assert_eq!(
            fs::read_to_string(scratch.join("Makefile")).unwrap(),
            "obj-m += hp-wmi.o\n"
        );

        let call = &runner.calls()[0];
        assert_eq!(call.get_args()[0], "-C");
        assert_eq!(call.get_args()[1], temp.path().join("kernel").display().to_string());
        assert_eq!(call.get_args()[2], format!("M={}", scratch.display()));
        assert!(call.get_args()[3].starts_with("-j"));
        assert_eq!(call.get_args()[4], "modules");
        assert_eq!(call.get_current_dir(), Some(scratch.as_path()));

        artifact.discard().unwrap();
        assert!(!scratch.exists());
    }

    #[test]
    fn test_stale_scratch_is_cleared() {
        let temp = TempDir::new().unwrap();
        let scratch = temp.path().join("hp-wmi-build");
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("hp-wmi.ko"), "stale").unwrap();
        let runner = FakeRunner::new().on("make", |_| Ok(crate::testing::ok("")));

        let err = build_module(&runner, &target(temp.path()), "hp-wmi", &source(temp.path()), &scratch)
            .unwrap_err()
            .to_string();
        assert!(err.contains("produced no hp-wmi.ko"), "{}", err);
    }

    #[test]
    fn test_missing_source_is_fatal_before_make() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let err = build_module(
            &runner,
            &target(temp.path()),
            "hp-wmi",
            &temp.path().join("missing.c"),
            &temp.path().join("scratch"),
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("module source not found"));
        assert_eq!(runner.count("make"), 0);
        assert!(!temp.path().join("scratch").exists());
    }

    #[test]
    fn test_compile_failure_lists_build_directory() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new().on("make", |_| {
            Ok(failed(2, "hp-wmi.c:12: error: unknown type name 'foo'"))
        });
        let scratch = temp.path().join("hp-wmi-build");

        let err = build_module(&runner, &target(temp.path()), "hp-wmi", &source(temp.path()), &scratch)
            .unwrap_err()
            .to_string();

        assert!(err.contains("make exited with code 2"));
        assert!(err.contains("Makefile"));
        assert!(err.contains("hp-wmi.c"));
        assert!(err.contains("unknown type name"));
    }
}
