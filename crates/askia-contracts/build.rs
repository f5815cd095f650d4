use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    let manifest_dir =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest_dir
        .ancestors()
        .nth(2)
        .expect("workspace root")
        .to_path_buf();
    let schemas_dir = workspace_root.join("contracts/v1");
    let openapi_path = workspace_root.join("openapi/v1.yaml");

    println!("cargo:rerun-if-changed={}", schemas_dir.display());
    println!("cargo:rerun-if-changed={}", openapi_path.display());

    let schemas = collect_schemas(&workspace_root, &schemas_dir);

    let mut set_hasher = Sha256::new();
    for (reference, _, body) in &schemas {
        set_hasher.update(reference.as_bytes());
        set_hasher.update([0]);
        set_hasher.update(body.as_bytes());
        set_hasher.update([0]);
    }
    let set_sha = to_hex(&set_hasher.finalize());

    let openapi_bytes = fs::read(&openapi_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", openapi_path.display()));
    let openapi_sha = to_hex(&Sha256::digest(&openapi_bytes));
    let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut out = String::new();
    out.push_str(&format!(
        "pub const GENERATED_OPENAPI_SHA256: &str = {openapi_sha:?};\n"
    ));
    out.push_str(&format!(
        "pub const GENERATED_CONTRACTS_SET_SHA256: &str = {set_sha:?};\n"
    ));
    out.push_str(&format!(
        "pub const GENERATED_AT_RFC3339: &str = {generated_at:?};\n"
    ));
    out.push_str("pub const GENERATED_CONTRACT_SCHEMAS: &[(&str, &str, &str)] = &[\n");
    for (reference, sha, body) in &schemas {
        out.push_str(&format!("    ({reference:?}, {sha:?}, {body:?}),\n"));
    }
    out.push_str("];\n");

    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR"));
    fs::write(out_dir.join("generated_contracts.rs"), out).expect("write generated_contracts.rs");
}

/// Returns `(reference, sha256, body)` for every schema, sorted by path.
fn collect_schemas(workspace_root: &Path, dir: &Path) -> Vec<(String, String, String)> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", dir.display()))
        .filter_map(|entry| entry.ok().map(|v| v.path()))
        .filter(|path| is_schema_file(path))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            println!("cargo:rerun-if-changed={}", path.display());
            let bytes = fs::read(&path)
                .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()));
            let sha = to_hex(&Sha256::digest(&bytes));
            let body = String::from_utf8(bytes)
                .unwrap_or_else(|e| panic!("schema is not valid utf-8 {}: {e}", path.display()));
            let rel = path
                .strip_prefix(workspace_root)
                .unwrap_or_else(|e| panic!("schema outside workspace {}: {e}", path.display()));
            let reference = format!("../{}", rel.to_string_lossy().replace('\\', "/"));
            (reference, sha, body)
        })
        .collect()
}

fn is_schema_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(".schema.json"))
        .unwrap_or(false)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
