// Collects src/jobs/*_job.rs into a manifest of job modules.
// A module that defines `pub fn register` gets an entrypoint; one without it is
// listed so the loader can report it as skipped. template_job.rs is a scaffold
// for new modules and never loaded.
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::{env, fs};

const JOBS_DIR: &str = "src/jobs";
const SUFFIX: &str = "_job.rs";
const TEMPLATE: &str = "template_job.rs";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed={}", JOBS_DIR);

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
    let jobs_dir = manifest_dir.join(JOBS_DIR);

    let mut modules = Vec::new();
    for entry in fs::read_dir(&jobs_dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.ends_with(SUFFIX) || file_name == TEMPLATE {
            continue;
        }
        println!("cargo:rerun-if-changed={}", path.display());

        let name = file_name.trim_end_matches(".rs").to_string();
        let has_entrypoint = fs::read_to_string(&path)?.contains("pub fn register(");
        modules.push((name, path, has_entrypoint));
    }
    modules.sort();

    let out = PathBuf::from(env::var("OUT_DIR")?).join("job_manifest.rs");
    fs::write(out, render(&modules)?)?;
    Ok(())
}

fn render(modules: &[(String, PathBuf, bool)]) -> Result<String, std::fmt::Error> {
    let mut code = String::from("// @generated by build.rs from src/jobs\n\n");

    for (name, path, _) in modules {
        writeln!(code, "#[path = {:?}]", display(path))?;
        writeln!(code, "pub mod {};", name)?;
    }

    code.push_str("\n/// Job modules found in `src/jobs`, sorted by file name\n");
    code.push_str("pub fn discovered_modules() -> Vec<JobModule<JobContext>> {\n    vec![\n");
    for (name, _, has_entrypoint) in modules {
        if *has_entrypoint {
            writeln!(code, "        JobModule::new({:?}, {}::register),", name, name)?;
        } else {
            writeln!(code, "        JobModule::without_entrypoint({:?}),", name)?;
        }
    }
    code.push_str("    ]\n}\n");
    Ok(code)
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
