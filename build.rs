use std::error::Error;

use vergen_git2::{BuildBuilder, CargoBuilder, Emitter, Git2Builder};

type BuildResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Emits `VERGEN_GIT_DESCRIBE` and friends; `main` logs the describe string
/// at start-up
fn emit_version_info() -> BuildResult {
    let build = BuildBuilder::default().build_timestamp(true).build()?;
    let cargo = CargoBuilder::default().target_triple(true).build()?;
    let git = Git2Builder::default()
        .describe(true, true, None)
        .sha(true)
        .build()?;

    Emitter::default()
        .add_instructions(&build)?
        .add_instructions(&cargo)?
        .add_instructions(&git)?
        .emit()?;
    Ok(())
}

fn main() -> BuildResult {
    emit_version_info()?;

    // Migrations are embedded with embed_migrations!
    println!("cargo:rerun-if-changed=migrations");

    let target = std::env::var("TARGET").unwrap_or_default();
    if target.contains("musl") && std::env::var_os("CARGO_FEATURE_BUNDLED_POSTGRES").is_none() {
        println!(
            "cargo:warning=musl target without the bundled-postgres feature; libpq will not link statically"
        );
    }

    Ok(())
}
