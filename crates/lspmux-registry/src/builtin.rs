//! Bundled server specs.

use serde_json::{json, Value};

use crate::{BinarySpec, DiagnosticsMode, InstallHint, ServerSpec};

pub(crate) static SPECS: &[ServerSpec] = &[
    // TypeScript (native tsgo port). The server only supports pull
    // diagnostics, so the mux advertises the capability on behalf of
    // clients and bridges the results back as publish notifications.
    ServerSpec {
        name: "tsgo",
        aliases: &["tsgo-lsp", "typescript-go"],
        binary: BinarySpec {
            env_var: "LSPMUX_TSGO_PATH",
            candidates: &["tsgo", "native-preview"],
            local_probe: Some("node_modules/.bin"),
            install: Some(InstallHint {
                package: "@typescript/native-preview",
                command: "npm install @typescript/native-preview",
            }),
        },
        args: &["--lsp", "--stdio"],
        diagnostics: DiagnosticsMode::PullBridge {
            debounce_ms: 150,
            build_request: None,
        },
        prepare_initialize: Some(advertise_pull_diagnostics),
    },
    // Oxlint language server. Pushes diagnostics itself.
    ServerSpec {
        name: "oxlint",
        aliases: &["oxc"],
        binary: BinarySpec {
            env_var: "LSPMUX_OXLINT_PATH",
            candidates: &["oxc_language_server"],
            local_probe: Some("node_modules/.bin"),
            install: Some(InstallHint {
                package: "oxlint",
                command: "npm install oxlint",
            }),
        },
        args: &[],
        diagnostics: DiagnosticsMode::Passthrough,
        prepare_initialize: None,
    },
];

/// Merge `textDocument.diagnostic` into the client capabilities unless the
/// client already requested it.
fn advertise_pull_diagnostics(mut params: Value) -> Value {
    let root = ensure_object(&mut params);
    let capabilities = ensure_object(root.entry("capabilities").or_insert(Value::Null));
    let text_document = ensure_object(capabilities.entry("textDocument").or_insert(Value::Null));
    if !text_document.contains_key("diagnostic") {
        text_document.insert("diagnostic".into(), json!({ "dynamicRegistration": false }));
    }
    params
}

/// Coerce a value slot into a JSON object, replacing non-objects.
fn ensure_object(slot: &mut Value) -> &mut serde_json::Map<String, Value> {
    if !matches!(slot, Value::Object(_)) {
        *slot = Value::Object(serde_json::Map::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot was just normalized to an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{all, lookup, resolve_binary};

    #[test]
    fn lookup_by_name() {
        assert_eq!(lookup("tsgo").unwrap().name, "tsgo");
        assert_eq!(lookup("oxlint").unwrap().name, "oxlint");
    }

    #[test]
    fn lookup_by_alias() {
        assert_eq!(lookup("typescript-go").unwrap().name, "tsgo");
        assert_eq!(lookup("oxc").unwrap().name, "oxlint");
    }

    #[test]
    fn lookup_unknown_fails() {
        let err = lookup("clangd").unwrap_err();
        assert!(err.to_string().contains("clangd"));
        assert!(err.to_string().contains("tsgo"));
    }

    #[test]
    fn specs_are_distinct() {
        let names: Vec<_> = all().iter().map(|s| s.name).collect();
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names, deduped);
    }

    #[test]
    fn tsgo_uses_pull_bridge_with_150ms_debounce() {
        let spec = lookup("tsgo").unwrap();
        match spec.diagnostics {
            DiagnosticsMode::PullBridge { debounce_ms, .. } => assert_eq!(debounce_ms, 150),
            DiagnosticsMode::Passthrough => panic!("tsgo must use the pull bridge"),
        }
    }

    #[test]
    fn oxlint_is_passthrough() {
        let spec = lookup("oxlint").unwrap();
        assert!(matches!(spec.diagnostics, DiagnosticsMode::Passthrough));
    }

    #[test]
    fn prepare_initialize_injects_diagnostic_capability() {
        let hook = lookup("tsgo").unwrap().prepare_initialize.unwrap();
        let out = hook(json!({"capabilities": {}}));
        assert!(out["capabilities"]["textDocument"]["diagnostic"].is_object());
    }

    #[test]
    fn prepare_initialize_keeps_existing_capability() {
        let hook = lookup("tsgo").unwrap().prepare_initialize.unwrap();
        let out = hook(json!({
            "capabilities": {"textDocument": {"diagnostic": {"dynamicRegistration": true}}}
        }));
        assert_eq!(
            out["capabilities"]["textDocument"]["diagnostic"]["dynamicRegistration"],
            true
        );
    }

    #[test]
    fn prepare_initialize_tolerates_empty_params() {
        let hook = lookup("tsgo").unwrap().prepare_initialize.unwrap();
        let out = hook(json!({}));
        assert!(out["capabilities"]["textDocument"]["diagnostic"].is_object());
    }

    #[test]
    fn prepare_initialize_preserves_other_params() {
        let hook = lookup("tsgo").unwrap().prepare_initialize.unwrap();
        let out = hook(json!({"rootUri": "file:///proj", "capabilities": {"workspace": {}}}));
        assert_eq!(out["rootUri"], "file:///proj");
        assert!(out["capabilities"]["workspace"].is_object());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_binary_prefers_env_override() {
        let spec = lookup("oxlint").unwrap();
        std::env::set_var("LSPMUX_OXLINT_PATH", "/opt/custom/oxc_language_server");
        let resolved = resolve_binary(spec, std::path::Path::new("/tmp"));
        std::env::remove_var("LSPMUX_OXLINT_PATH");
        assert_eq!(
            resolved.unwrap(),
            std::path::PathBuf::from("/opt/custom/oxc_language_server")
        );
    }

    #[cfg(unix)]
    #[test]
    fn resolve_binary_probes_project_local_bin() {
        use std::os::unix::fs::PermissionsExt;

        let spec = lookup("tsgo").unwrap();
        let root = tempfile::tempdir().unwrap();
        let bin_dir = root.path().join("node_modules/.bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let bin = bin_dir.join("tsgo");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Hide PATH so the probe is the only hit.
        let saved_path = std::env::var_os("PATH");
        std::env::set_var("PATH", "");
        let resolved = resolve_binary(spec, root.path());
        if let Some(p) = saved_path {
            std::env::set_var("PATH", p);
        }
        assert_eq!(resolved.unwrap(), bin);
    }

    #[test]
    fn resolve_binary_error_names_install_hint() {
        let spec = lookup("tsgo").unwrap();
        let saved_path = std::env::var_os("PATH");
        std::env::set_var("PATH", "");
        let err = resolve_binary(spec, std::path::Path::new("/nonexistent"));
        if let Some(p) = saved_path {
            std::env::set_var("PATH", p);
        }
        let message = err.unwrap_err().to_string();
        assert!(message.contains("tsgo"));
        assert!(message.contains("@typescript/native-preview"));
    }
}
