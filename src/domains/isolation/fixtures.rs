//! `sh` plugin packages used by tests.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};

const SCRIPT: &str = r##"tab=$(printf '\t')
reply() {
  printf '{"isError":%s,"content":[{"type":"text","text":"%s"}]}\n' "$1" "$2"
}
while IFS= read -r line; do
  case "$line" in
    list_tools)
      printf '%s\n' '@TOOLS@'
      ;;
    execute_tool*)
      rest=${line#*"$tab"}
      tool=${rest%%"$tab"*}
      args=${rest#*"$tab"}
      @EXECUTE@
      ;;
    shutdown)
      exit 0
      ;;
  esac
done
"##;

/// Write `<name>.mcp-plugin` with `body` and a manifest running it through `sh`.
pub fn write_script_plugin(dir: &Path, name: &str, body: &str) -> PathBuf {
    write_plugin(dir, name, body, json!({ "interpreter": "sh" }))
}

/// Write a plugin package with an explicit manifest.
pub fn write_plugin(dir: &Path, name: &str, body: &str, manifest: Value) -> PathBuf {
    let module = dir.join(format!("{name}.mcp-plugin"));
    std::fs::write(&module, body).unwrap();
    std::fs::write(
        dir.join(format!("{name}.deps.json")),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
    module
}

/// A script answering the line protocol with `tools` and an `execute` body.
///
/// The body sees `$tool` and `$args` and answers with `reply <isError> <text>`.
pub fn tool_script(tools: &Value, execute: &str) -> String {
    SCRIPT
        .replace("@TOOLS@", &tools.to_string())
        .replace("@EXECUTE@", execute)
}

fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("Test tool {name}"),
        "inputSchema": { "type": "object" }
    })
}

/// Plugin with one `echo_text` tool returning its raw arguments.
pub fn write_echo_plugin(dir: &Path, name: &str) -> PathBuf {
    let body = tool_script(
        &json!([tool("echo_text")]),
        r#"escaped=$(printf '%s' "$args" | sed 's/\\/\\\\/g; s/"/\\"/g')
      reply false "$escaped""#,
    );
    write_script_plugin(dir, name, &body)
}

/// Plugin whose `dependency_version` tool reports its private copy of `shared`.
pub fn write_versioned_plugin(dir: &Path, name: &str, version: &str) -> PathBuf {
    let libs = dir.join("libs");
    std::fs::create_dir_all(&libs).unwrap();
    let library = format!("shared-{version}");
    std::fs::write(libs.join(&library), format!("{version}\n")).unwrap();

    let body = tool_script(
        &json!([tool("dependency_version")]),
        r#"reply false "$(cat "$MCP_DEP_SHARED")""#,
    );
    write_plugin(
        dir,
        name,
        &body,
        json!({
            "interpreter": "sh",
            "dependencies": [
                { "name": "shared", "version": version, "path": format!("libs/{library}") }
            ]
        }),
    )
}

/// Plugin shipping its own `host-geometry` copy, which must be ignored.
pub fn write_host_shared_plugin(dir: &Path, name: &str) -> PathBuf {
    std::fs::write(dir.join("host-geometry"), "private\n").unwrap();

    let body = tool_script(
        &json!([tool("geometry_owner")]),
        r#"reply false "$(cat "$MCP_DEP_HOST_GEOMETRY")""#,
    );
    write_plugin(
        dir,
        name,
        &body,
        json!({
            "interpreter": "sh",
            "dependencies": [{ "name": "host-geometry", "path": "host-geometry" }]
        }),
    )
}

/// Plugin exposing tools named `names`, each answering with `label`.
pub fn write_labelled_plugin(dir: &Path, name: &str, names: &[&str], label: &str) -> PathBuf {
    let tools: Vec<Value> = names.iter().map(|n| tool(n)).collect();
    let body = tool_script(&json!(tools), &format!(r#"reply false "{label}:$tool""#));
    write_script_plugin(dir, name, &body)
}

/// Plugin that lists `stall` but never answers a tool call.
pub fn write_stalling_plugin(dir: &Path, name: &str) -> PathBuf {
    let body = tool_script(&json!([tool("stall")]), "read -r hold");
    write_script_plugin(dir, name, &body)
}
