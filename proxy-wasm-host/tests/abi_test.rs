//! ABI dispatch against real modules compiled by wasmtime

use proxy_wasm_host::{
    AbiCall, AbiError, Action, PluginConfig, PluginLoader, VmConfig, WasmManager, WasmPlugin,
};
use std::fs;
use std::ops::ControlFlow;
use std::sync::Arc;
use tempfile::TempDir;

/// A filter that pauses request headers unless end_of_stream is set,
/// counts ticks in a global, calls an unprovided host function on
/// response headers, and traps on gRPC close.
const FILTER_WAT: &str = r#"
(module
  (import "env" "proxy_log" (func $proxy_log (param i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (global $ticks (mut i32) (i32.const 0))

  (func (export "_start"))

  (func (export "proxy_on_context_create") (param i32 i32))

  (func (export "proxy_on_vm_start") (param i32 i32) (result i32)
    i32.const 1)

  (func (export "proxy_on_configure") (param $root i32) (param $size i32) (result i32)
    local.get $size
    i32.const 0
    i32.gt_s)

  (func (export "proxy_on_tick") (param i32)
    global.get $ticks
    i32.const 1
    i32.add
    global.set $ticks)

  (func (export "proxy_on_request_headers") (param $ctx i32) (param $n i32) (param $eos i32) (result i32)
    local.get $eos
    i32.eqz)

  (func (export "proxy_on_response_headers") (param i32 i32 i32) (result i32)
    i32.const 0
    i32.const 0
    i32.const 0
    call $proxy_log)

  (func (export "proxy_on_http_call_response") (param i32 i32 i32 i32 i32))

  (func (export "proxy_on_grpc_close") (param i32 i32 i32)
    unreachable)

  (func (export "proxy_on_done") (param i32))
)
"#;

fn write_module(dir: &TempDir, name: &str, wat_text: &str) -> String {
    let path = dir.path().join(name);
    fs::write(&path, wat::parse_str(wat_text).unwrap()).unwrap();
    path.to_str().unwrap().to_string()
}

fn load_filter(dir: &TempDir, instances: i32) -> Arc<WasmPlugin> {
    let path = write_module(dir, "filter.wasm", FILTER_WAT);
    PluginLoader::with_defaults()
        .unwrap()
        .load(PluginConfig::new("filter", VmConfig::from_path(path)).with_instance_num(instances))
        .unwrap()
}

#[test]
fn test_action_codes() {
    let temp = TempDir::new().unwrap();
    let plugin = load_filter(&temp, 1);
    let instance = plugin.get_instance().unwrap();
    let mut abi = instance.lock();

    abi.start().unwrap();
    abi.proxy_on_context_create(1, 0).unwrap();
    assert_eq!(abi.proxy_on_vm_start(1, 0).unwrap(), 1);
    assert_eq!(abi.proxy_on_configure(1, 16).unwrap(), 1);
    assert_eq!(abi.proxy_on_configure(1, 0).unwrap(), 0);

    let action = Action::from(abi.proxy_on_request_headers(2, 4, 0).unwrap());
    assert_eq!(action, Action::Pause);
    let action = Action::from(abi.proxy_on_request_headers(2, 4, 1).unwrap());
    assert_eq!(action, Action::Continue);

    abi.proxy_on_http_call_response(2, 7, 1, 0, 0).unwrap();
    drop(abi);
    plugin.release_instance(&instance);
}

#[test]
fn test_missing_optional_callbacks() {
    let temp = TempDir::new().unwrap();
    let plugin = load_filter(&temp, 1);
    let instance = plugin.get_instance().unwrap();
    let mut abi = instance.lock();

    for result in [
        abi.proxy_on_log(1),
        abi.proxy_on_delete(1),
        abi.proxy_on_new_connection(1),
        abi.proxy_on_queue_ready(1, 3),
        abi.proxy_on_foreign_function(1, 2, 0),
        abi.proxy_on_grpc_receive(1, 2, 10),
    ] {
        assert!(result.unwrap_err().is_export_not_found());
    }

    match abi.proxy_on_request_body(1, 100, 1) {
        Err(AbiError::ExportNotFound { call }) => assert_eq!(call, AbiCall::RequestBody),
        other => panic!("Expected ExportNotFound, got {:?}", other),
    }
    assert!(!abi.has_export(AbiCall::ValidateConfiguration));
    assert!(abi.has_export(AbiCall::Start));
}

#[test]
fn test_traps_are_passed_through() {
    let temp = TempDir::new().unwrap();
    let plugin = load_filter(&temp, 1);
    let instance = plugin.get_instance().unwrap();
    let mut abi = instance.lock();

    match abi.proxy_on_grpc_close(1, 2, 14) {
        Err(AbiError::Runtime { call, .. }) => assert_eq!(call, AbiCall::GrpcClose),
        other => panic!("Expected Runtime error, got {:?}", other),
    }

    // Host functions are not provided at this layer; calling one traps
    match abi.proxy_on_response_headers(1, 2, 0) {
        Err(AbiError::Runtime { call, .. }) => assert_eq!(call, AbiCall::ResponseHeaders),
        other => panic!("Expected Runtime error, got {:?}", other),
    }

    // The instance stays usable after a trap
    assert_eq!(abi.proxy_on_vm_start(1, 0).unwrap(), 1);
}

#[test]
fn test_code_call_without_result() {
    let temp = TempDir::new().unwrap();
    let plugin = load_filter(&temp, 1);
    let instance = plugin.get_instance().unwrap();

    // The module declares proxy_on_done without a result
    let result = instance.lock().proxy_on_done(1);
    match result {
        Err(AbiError::MissingResult { call }) => assert_eq!(call, AbiCall::Done),
        other => panic!("Expected MissingResult, got {:?}", other),
    }
    plugin.release_instance(&instance);
}

#[test]
fn test_tick_broadcast_reaches_every_instance() {
    let temp = TempDir::new().unwrap();
    let plugin = load_filter(&temp, 3);

    let mut ticked = Vec::new();
    for _ in 0..2 {
        plugin.exec(|instance| {
            instance.lock().proxy_on_tick(1).unwrap();
            ticked.push(instance.id());
            ControlFlow::Continue(())
        });
    }

    assert_eq!(ticked.len(), 6);
    assert_eq!(ticked[..3], ticked[3..]);
    assert_eq!(plugin.occupancy(), 0);
}

#[test]
fn test_manager_with_wasmtime() {
    let temp = TempDir::new().unwrap();
    let path = write_module(&temp, "filter.wasm", FILTER_WAT);

    let manager = WasmManager::with_defaults().unwrap();
    manager
        .add_or_update_wasm(PluginConfig::new("filter", VmConfig::from_path(path)).with_instance_num(2))
        .unwrap();

    let plugin = manager
        .get_wasm_plugin_wrapper_by_name("filter")
        .unwrap()
        .plugin();
    let instance = plugin.get_instance().unwrap();
    assert_eq!(instance.lock().proxy_on_request_headers(1, 0, 0).unwrap(), 1);
    plugin.release_instance(&instance);

    manager.uninstall_wasm_plugin_by_name("filter").unwrap();
    assert!(manager.is_empty());
}
