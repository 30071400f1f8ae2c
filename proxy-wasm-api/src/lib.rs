//! proxy-wasm-api: Shared types for the proxy-wasm extension host
//!
//! This crate defines the contract between the host and an extension
//! module: the fixed table of ABI exports the host may call, and the
//! plugin configuration consumed from the proxy's config layer.

use serde::{Deserialize, Serialize};

/// Engine identifier used when a config does not name one
pub const DEFAULT_ENGINE: &str = "wasmtime";

/// One callback export of the proxy-wasm ABI
///
/// Every parameter of every call is an `i32` whose meaning is private to
/// the extension (context ids, buffer lengths, end-of-stream flags, tokens).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiCall {
    Start,

    ContextCreate,
    Done,
    Log,
    Delete,

    VmStart,
    Configure,
    Tick,

    NewConnection,
    DownstreamData,
    DownstreamConnectionClose,
    UpstreamData,
    UpstreamConnectionClose,

    RequestHeaders,
    RequestBody,
    RequestTrailers,
    RequestMetadata,
    ResponseHeaders,
    ResponseBody,
    ResponseTrailers,
    ResponseMetadata,

    HttpCallResponse,

    GrpcReceiveInitialMetadata,
    GrpcTrailingMetadata,
    GrpcReceive,
    GrpcClose,

    QueueReady,

    ValidateConfiguration,
    ForeignFunction,
}

impl AbiCall {
    /// Number of ABI calls
    pub const COUNT: usize = 29;

    /// All calls, in dispatch-table order
    pub const ALL: [AbiCall; Self::COUNT] = [
        AbiCall::Start,
        AbiCall::ContextCreate,
        AbiCall::Done,
        AbiCall::Log,
        AbiCall::Delete,
        AbiCall::VmStart,
        AbiCall::Configure,
        AbiCall::Tick,
        AbiCall::NewConnection,
        AbiCall::DownstreamData,
        AbiCall::DownstreamConnectionClose,
        AbiCall::UpstreamData,
        AbiCall::UpstreamConnectionClose,
        AbiCall::RequestHeaders,
        AbiCall::RequestBody,
        AbiCall::RequestTrailers,
        AbiCall::RequestMetadata,
        AbiCall::ResponseHeaders,
        AbiCall::ResponseBody,
        AbiCall::ResponseTrailers,
        AbiCall::ResponseMetadata,
        AbiCall::HttpCallResponse,
        AbiCall::GrpcReceiveInitialMetadata,
        AbiCall::GrpcTrailingMetadata,
        AbiCall::GrpcReceive,
        AbiCall::GrpcClose,
        AbiCall::QueueReady,
        AbiCall::ValidateConfiguration,
        AbiCall::ForeignFunction,
    ];

    /// Position of this call in [`AbiCall::ALL`]
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Exported function name, exactly as the ABI spells it
    pub fn export_name(self) -> &'static str {
        match self {
            AbiCall::Start => "_start",
            AbiCall::ContextCreate => "proxy_on_context_create",
            AbiCall::Done => "proxy_on_done",
            AbiCall::Log => "proxy_on_log",
            AbiCall::Delete => "proxy_on_delete",
            AbiCall::VmStart => "proxy_on_vm_start",
            AbiCall::Configure => "proxy_on_configure",
            AbiCall::Tick => "proxy_on_tick",
            AbiCall::NewConnection => "proxy_on_new_connection",
            AbiCall::DownstreamData => "proxy_on_downstream_data",
            AbiCall::DownstreamConnectionClose => "proxy_on_downstream_connection_close",
            AbiCall::UpstreamData => "proxy_on_upstream_data",
            AbiCall::UpstreamConnectionClose => "proxy_on_upstream_connection_close",
            AbiCall::RequestHeaders => "proxy_on_request_headers",
            AbiCall::RequestBody => "proxy_on_request_body",
            AbiCall::RequestTrailers => "proxy_on_request_trailers",
            AbiCall::RequestMetadata => "proxy_on_request_metadata",
            AbiCall::ResponseHeaders => "proxy_on_response_headers",
            AbiCall::ResponseBody => "proxy_on_response_body",
            AbiCall::ResponseTrailers => "proxy_on_response_trailers",
            AbiCall::ResponseMetadata => "proxy_on_response_metadata",
            AbiCall::HttpCallResponse => "proxy_on_http_call_response",
            AbiCall::GrpcReceiveInitialMetadata => "proxy_on_grpc_receive_initial_metadata",
            AbiCall::GrpcTrailingMetadata => "proxy_on_grpc_trailing_metadata",
            AbiCall::GrpcReceive => "proxy_on_grpc_receive",
            AbiCall::GrpcClose => "proxy_on_grpc_close",
            AbiCall::QueueReady => "proxy_on_queue_ready",
            AbiCall::ValidateConfiguration => "proxy_validate_configuration",
            AbiCall::ForeignFunction => "proxy_on_foreign_function",
        }
    }

    /// Number of `i32` parameters the export takes
    pub fn param_count(self) -> usize {
        match self {
            AbiCall::Start => 0,

            AbiCall::Done
            | AbiCall::Log
            | AbiCall::Delete
            | AbiCall::Tick
            | AbiCall::NewConnection => 1,

            AbiCall::ContextCreate
            | AbiCall::VmStart
            | AbiCall::Configure
            | AbiCall::DownstreamConnectionClose
            | AbiCall::UpstreamConnectionClose
            | AbiCall::RequestTrailers
            | AbiCall::RequestMetadata
            | AbiCall::ResponseTrailers
            | AbiCall::ResponseMetadata
            | AbiCall::QueueReady
            | AbiCall::ValidateConfiguration => 2,

            AbiCall::DownstreamData
            | AbiCall::UpstreamData
            | AbiCall::RequestHeaders
            | AbiCall::RequestBody
            | AbiCall::ResponseHeaders
            | AbiCall::ResponseBody
            | AbiCall::GrpcReceiveInitialMetadata
            | AbiCall::GrpcTrailingMetadata
            | AbiCall::GrpcReceive
            | AbiCall::GrpcClose
            | AbiCall::ForeignFunction => 3,

            AbiCall::HttpCallResponse => 5,
        }
    }

    /// Whether the export returns an `i32` status/action code
    pub fn yields_code(self) -> bool {
        matches!(
            self,
            AbiCall::Done
                | AbiCall::VmStart
                | AbiCall::Configure
                | AbiCall::DownstreamData
                | AbiCall::UpstreamData
                | AbiCall::RequestHeaders
                | AbiCall::RequestBody
                | AbiCall::RequestTrailers
                | AbiCall::RequestMetadata
                | AbiCall::ResponseHeaders
                | AbiCall::ResponseBody
                | AbiCall::ResponseTrailers
                | AbiCall::ResponseMetadata
                | AbiCall::ValidateConfiguration
        )
    }

    /// Look up a call by its export name
    pub fn from_export_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.export_name() == name)
    }
}

impl std::fmt::Display for AbiCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.export_name())
    }
}

/// Action code returned by stream and HTTP callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Pause,
    /// Any code outside the ABI's defined range
    Unknown(i32),
}

impl From<i32> for Action {
    fn from(code: i32) -> Self {
        match code {
            0 => Action::Continue,
            1 => Action::Pause,
            other => Action::Unknown(other),
        }
    }
}

impl From<Action> for i32 {
    fn from(action: Action) -> Self {
        match action {
            Action::Continue => 0,
            Action::Pause => 1,
            Action::Unknown(code) => code,
        }
    }
}

/// Where the module bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmSource<'a> {
    Path(&'a str),
    Url(&'a str),
}

impl std::fmt::Display for WasmSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WasmSource::Path(p) => write!(f, "path:{}", p),
            WasmSource::Url(u) => write!(f, "url:{}", u),
        }
    }
}

/// Virtual machine settings of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Engine identifier (e.g. "wasmtime")
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Local path of the module
    #[serde(default)]
    pub path: String,

    /// Remote location of the module, used when `path` is empty
    #[serde(default)]
    pub url: String,

    /// CPU limit, advisory
    #[serde(default)]
    pub cpu: i32,

    /// Memory limit, advisory
    #[serde(default)]
    pub mem: i32,
}

fn default_engine() -> String {
    DEFAULT_ENGINE.to_string()
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            path: String::new(),
            url: String::new(),
            cpu: 0,
            mem: 0,
        }
    }
}

impl VmConfig {
    /// Config for a module on the local filesystem
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Config for a module fetched from a URL
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Builder: set the engine identifier
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    /// Source of the module bytes; path wins over url
    pub fn source(&self) -> Option<WasmSource<'_>> {
        if !self.path.is_empty() {
            Some(WasmSource::Path(&self.path))
        } else if !self.url.is_empty() {
            Some(WasmSource::Url(&self.url))
        } else {
            None
        }
    }

    /// Whether switching from `other` to `self` needs a freshly compiled module
    pub fn requires_rebuild(&self, other: &VmConfig) -> bool {
        self.engine != other.engine || self.path != other.path || self.url != other.url
    }
}

/// Configuration of one named plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Identity key in the plugin registry
    pub plugin_name: String,

    /// Desired pool size; `<= 0` means available parallelism
    #[serde(default)]
    pub instance_num: i32,

    #[serde(default)]
    pub vm_config: Option<VmConfig>,
}

impl PluginConfig {
    /// Create a config with a VM config and the default instance count
    pub fn new(plugin_name: impl Into<String>, vm_config: VmConfig) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            instance_num: 0,
            vm_config: Some(vm_config),
        }
    }

    /// Builder: set the desired instance count
    pub fn with_instance_num(mut self, instance_num: i32) -> Self {
        self.instance_num = instance_num;
        self
    }

    /// Parse a config from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Desired pool size with the `<= 0` default applied
    pub fn resolved_instance_num(&self) -> usize {
        match usize::try_from(self.instance_num) {
            Ok(n) if n > 0 => n,
            _ => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}
