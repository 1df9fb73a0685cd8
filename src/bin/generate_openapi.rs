//! Writes the measurement API's OpenAPI document, or checks a committed
//! copy for drift.
//!
//! Usage:
//!   cargo run --bin generate_openapi > openapi.json
//!   cargo run --bin generate_openapi -- --output openapi.json
//!   cargo run --bin generate_openapi -- --check openapi.json

use std::{
    env, fs,
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{Context, Result};
use plant_telemetry::api::handlers::ApiDoc;
use utoipa::OpenApi;

enum Mode {
    Stdout,
    Write(PathBuf),
    Check(PathBuf),
}

fn mode(args: &[String]) -> Mode {
    let flag = |name: &str| {
        args.windows(2)
            .find(|w| w[0] == name)
            .map(|w| PathBuf::from(&w[1]))
    };
    if let Some(path) = flag("--check") {
        Mode::Check(path)
    } else if let Some(path) = flag("--output") {
        Mode::Write(path)
    } else {
        Mode::Stdout
    }
}

fn main() -> Result<ExitCode> {
    let json = ApiDoc::openapi()
        .to_pretty_json()
        .context("failed to serialise OpenAPI document")?;
    let args: Vec<String> = env::args().collect();

    match mode(&args) {
        Mode::Stdout => {
            io::stdout()
                .write_all(json.as_bytes())
                .context("failed to write to stdout")?;
        }
        Mode::Write(path) => {
            fs::write(&path, &json).with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("OpenAPI document written to {}", path.display());
        }
        Mode::Check(path) => {
            let committed = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if committed.trim_end() != json.trim_end() {
                eprintln!(
                    "{} is out of date; regenerate it with --output {}",
                    path.display(),
                    path.display()
                );
                return Ok(ExitCode::FAILURE);
            }
            eprintln!("{} matches the API", path.display());
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn check_takes_precedence_over_output() {
        assert!(matches!(mode(&args(&["bin"])), Mode::Stdout));
        assert!(matches!(
            mode(&args(&["bin", "--output", "a.json"])),
            Mode::Write(p) if p == PathBuf::from("a.json")
        ));
        assert!(matches!(
            mode(&args(&["bin", "--output", "a.json", "--check", "b.json"])),
            Mode::Check(p) if p == PathBuf::from("b.json")
        ));
    }
}
