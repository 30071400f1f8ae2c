//! Typed proxy-wasm ABI dispatcher
//!
//! Wraps one extension instance and exposes every ABI callback as a typed
//! method. Exports are resolved once when the dispatcher is built; a
//! callback the module does not export fails with
//! [`AbiError::ExportNotFound`], which the proxy treats as "not
//! implemented". Engine failures are returned unchanged and never retried.

use crate::engine::{ExportSlot, WasmInstance};
use proxy_wasm_api::AbiCall;
use thiserror::Error;

/// Errors returned by ABI calls
#[derive(Debug, Error)]
pub enum AbiError {
    #[error("func {call} not found")]
    ExportNotFound { call: AbiCall },

    #[error("func {call} failed: {source}")]
    Runtime {
        call: AbiCall,
        #[source]
        source: anyhow::Error,
    },

    #[error("func {call} returned no status code")]
    MissingResult { call: AbiCall },
}

impl AbiError {
    /// The call that failed
    pub fn call(&self) -> AbiCall {
        match self {
            Self::ExportNotFound { call }
            | Self::Runtime { call, .. }
            | Self::MissingResult { call } => *call,
        }
    }

    /// Whether the extension simply does not implement the callback
    pub fn is_export_not_found(&self) -> bool {
        matches!(self, Self::ExportNotFound { .. })
    }
}

/// Dispatch table over one extension instance
pub struct AbiDispatcher {
    instance: Box<dyn WasmInstance>,
    exports: [Option<ExportSlot>; AbiCall::COUNT],
}

impl AbiDispatcher {
    /// Resolve every ABI export of `instance` and build the table
    pub fn new(mut instance: Box<dyn WasmInstance>) -> Self {
        let mut exports = [None; AbiCall::COUNT];
        for call in AbiCall::ALL {
            exports[call.index()] = instance.resolve_export(call.export_name());
        }

        tracing::trace!(
            exported = exports.iter().filter(|slot| slot.is_some()).count(),
            "Built ABI dispatch table"
        );

        Self { instance, exports }
    }

    /// Whether the instance exports `call`
    pub fn has_export(&self, call: AbiCall) -> bool {
        self.exports[call.index()].is_some()
    }

    /// All calls the instance exports
    pub fn exported_calls(&self) -> impl Iterator<Item = AbiCall> + '_ {
        AbiCall::ALL
            .into_iter()
            .filter(move |call| self.has_export(*call))
    }

    fn invoke(&mut self, call: AbiCall, args: &[i32]) -> Result<Option<i32>, AbiError> {
        debug_assert_eq!(args.len(), call.param_count(), "{} arity", call);
        tracing::debug!(call = %call, "wasm call exported func");

        let slot = self.exports[call.index()].ok_or(AbiError::ExportNotFound { call })?;
        self.instance
            .invoke(slot, args)
            .map_err(|source| AbiError::Runtime { call, source })
    }

    fn call_void(&mut self, call: AbiCall, args: &[i32]) -> Result<(), AbiError> {
        self.invoke(call, args).map(|_| ())
    }

    fn call_code(&mut self, call: AbiCall, args: &[i32]) -> Result<i32, AbiError> {
        self.invoke(call, args)?
            .ok_or(AbiError::MissingResult { call })
    }

    /// `_start`
    pub fn start(&mut self) -> Result<(), AbiError> {
        self.call_void(AbiCall::Start, &[])
    }

    // Context lifecycle

    pub fn proxy_on_context_create(
        &mut self,
        context_id: i32,
        parent_context_id: i32,
    ) -> Result<(), AbiError> {
        self.call_void(AbiCall::ContextCreate, &[context_id, parent_context_id])
    }

    pub fn proxy_on_done(&mut self, context_id: i32) -> Result<i32, AbiError> {
        self.call_code(AbiCall::Done, &[context_id])
    }

    pub fn proxy_on_log(&mut self, context_id: i32) -> Result<(), AbiError> {
        self.call_void(AbiCall::Log, &[context_id])
    }

    pub fn proxy_on_delete(&mut self, context_id: i32) -> Result<(), AbiError> {
        self.call_void(AbiCall::Delete, &[context_id])
    }

    // VM and root context lifecycle

    pub fn proxy_on_vm_start(
        &mut self,
        root_context_id: i32,
        configuration_size: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(AbiCall::VmStart, &[root_context_id, configuration_size])
    }

    pub fn proxy_on_configure(
        &mut self,
        root_context_id: i32,
        configuration_size: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(AbiCall::Configure, &[root_context_id, configuration_size])
    }

    pub fn proxy_validate_configuration(
        &mut self,
        root_context_id: i32,
        configuration_size: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(
            AbiCall::ValidateConfiguration,
            &[root_context_id, configuration_size],
        )
    }

    pub fn proxy_on_tick(&mut self, root_context_id: i32) -> Result<(), AbiError> {
        self.call_void(AbiCall::Tick, &[root_context_id])
    }

    pub fn proxy_on_foreign_function(
        &mut self,
        root_context_id: i32,
        function_id: i32,
        data_size: i32,
    ) -> Result<(), AbiError> {
        self.call_void(
            AbiCall::ForeignFunction,
            &[root_context_id, function_id, data_size],
        )
    }

    pub fn proxy_on_queue_ready(
        &mut self,
        root_context_id: i32,
        token: i32,
    ) -> Result<(), AbiError> {
        self.call_void(AbiCall::QueueReady, &[root_context_id, token])
    }

    // Network stream

    pub fn proxy_on_new_connection(&mut self, context_id: i32) -> Result<(), AbiError> {
        self.call_void(AbiCall::NewConnection, &[context_id])
    }

    pub fn proxy_on_downstream_data(
        &mut self,
        context_id: i32,
        data_length: i32,
        end_of_stream: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(
            AbiCall::DownstreamData,
            &[context_id, data_length, end_of_stream],
        )
    }

    pub fn proxy_on_downstream_connection_close(
        &mut self,
        context_id: i32,
        close_type: i32,
    ) -> Result<(), AbiError> {
        self.call_void(AbiCall::DownstreamConnectionClose, &[context_id, close_type])
    }

    pub fn proxy_on_upstream_data(
        &mut self,
        context_id: i32,
        data_length: i32,
        end_of_stream: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(
            AbiCall::UpstreamData,
            &[context_id, data_length, end_of_stream],
        )
    }

    pub fn proxy_on_upstream_connection_close(
        &mut self,
        context_id: i32,
        close_type: i32,
    ) -> Result<(), AbiError> {
        self.call_void(AbiCall::UpstreamConnectionClose, &[context_id, close_type])
    }

    // HTTP stream

    pub fn proxy_on_request_headers(
        &mut self,
        context_id: i32,
        headers: i32,
        end_of_stream: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(
            AbiCall::RequestHeaders,
            &[context_id, headers, end_of_stream],
        )
    }

    pub fn proxy_on_request_body(
        &mut self,
        context_id: i32,
        body_buffer_length: i32,
        end_of_stream: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(
            AbiCall::RequestBody,
            &[context_id, body_buffer_length, end_of_stream],
        )
    }

    pub fn proxy_on_request_trailers(
        &mut self,
        context_id: i32,
        trailers: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(AbiCall::RequestTrailers, &[context_id, trailers])
    }

    pub fn proxy_on_request_metadata(
        &mut self,
        context_id: i32,
        n_elements: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(AbiCall::RequestMetadata, &[context_id, n_elements])
    }

    pub fn proxy_on_response_headers(
        &mut self,
        context_id: i32,
        headers: i32,
        end_of_stream: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(
            AbiCall::ResponseHeaders,
            &[context_id, headers, end_of_stream],
        )
    }

    pub fn proxy_on_response_body(
        &mut self,
        context_id: i32,
        body_buffer_length: i32,
        end_of_stream: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(
            AbiCall::ResponseBody,
            &[context_id, body_buffer_length, end_of_stream],
        )
    }

    pub fn proxy_on_response_trailers(
        &mut self,
        context_id: i32,
        trailers: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(AbiCall::ResponseTrailers, &[context_id, trailers])
    }

    pub fn proxy_on_response_metadata(
        &mut self,
        context_id: i32,
        n_elements: i32,
    ) -> Result<i32, AbiError> {
        self.call_code(AbiCall::ResponseMetadata, &[context_id, n_elements])
    }

    // Outbound calls

    pub fn proxy_on_http_call_response(
        &mut self,
        context_id: i32,
        token: i32,
        headers: i32,
        body_size: i32,
        trailers: i32,
    ) -> Result<(), AbiError> {
        self.call_void(
            AbiCall::HttpCallResponse,
            &[context_id, token, headers, body_size, trailers],
        )
    }

    pub fn proxy_on_grpc_receive_initial_metadata(
        &mut self,
        context_id: i32,
        token: i32,
        headers: i32,
    ) -> Result<(), AbiError> {
        self.call_void(
            AbiCall::GrpcReceiveInitialMetadata,
            &[context_id, token, headers],
        )
    }

    pub fn proxy_on_grpc_trailing_metadata(
        &mut self,
        context_id: i32,
        token: i32,
        trailers: i32,
    ) -> Result<(), AbiError> {
        self.call_void(
            AbiCall::GrpcTrailingMetadata,
            &[context_id, token, trailers],
        )
    }

    pub fn proxy_on_grpc_receive(
        &mut self,
        context_id: i32,
        token: i32,
        response_size: i32,
    ) -> Result<(), AbiError> {
        self.call_void(AbiCall::GrpcReceive, &[context_id, token, response_size])
    }

    pub fn proxy_on_grpc_close(
        &mut self,
        context_id: i32,
        token: i32,
        status_code: i32,
    ) -> Result<(), AbiError> {
        self.call_void(AbiCall::GrpcClose, &[context_id, token, status_code])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::{Arc, Mutex};

    /// Exports everything except `proxy_on_tick`; records every call
    struct RecordingInstance {
        calls: Arc<Mutex<Vec<(String, Vec<i32>)>>>,
        names: Vec<&'static str>,
    }

    impl WasmInstance for RecordingInstance {
        fn resolve_export(&mut self, name: &str) -> Option<ExportSlot> {
            if name == "proxy_on_tick" {
                return None;
            }
            let call = AbiCall::from_export_name(name)?;
            self.names.push(call.export_name());
            Some(ExportSlot((self.names.len() - 1) as u32))
        }

        fn invoke(&mut self, slot: ExportSlot, args: &[i32]) -> anyhow::Result<Option<i32>> {
            let name = self.names[slot.0 as usize];
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), args.to_vec()));

            let call = AbiCall::from_export_name(name).unwrap();
            match call {
                AbiCall::GrpcClose => bail!("wasm trap: unreachable"),
                AbiCall::Configure => Ok(None),
                c if c.yields_code() => Ok(Some(args.iter().sum())),
                _ => Ok(None),
            }
        }
    }

    fn dispatcher() -> (AbiDispatcher, Arc<Mutex<Vec<(String, Vec<i32>)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let instance = RecordingInstance {
            calls: Arc::clone(&calls),
            names: Vec::new(),
        };
        (AbiDispatcher::new(Box::new(instance)), calls)
    }

    #[test]
    fn test_arguments_are_forwarded_in_order() {
        let (mut abi, calls) = dispatcher();

        abi.proxy_on_http_call_response(1, 2, 3, 4, 5).unwrap();
        assert_eq!(abi.proxy_on_request_headers(10, 3, 1).unwrap(), 14);

        let calls = calls.lock().unwrap();
        assert_eq!(
            calls[0],
            ("proxy_on_http_call_response".to_string(), vec![1, 2, 3, 4, 5])
        );
        assert_eq!(
            calls[1],
            ("proxy_on_request_headers".to_string(), vec![10, 3, 1])
        );
    }

    #[test]
    fn test_missing_export() {
        let (mut abi, calls) = dispatcher();

        assert!(!abi.has_export(AbiCall::Tick));
        let err = abi.proxy_on_tick(1).unwrap_err();
        assert!(err.is_export_not_found());
        assert_eq!(err.call(), AbiCall::Tick);
        assert_eq!(err.to_string(), "func proxy_on_tick not found");
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_runtime_failure_passes_through() {
        let (mut abi, _) = dispatcher();

        match abi.proxy_on_grpc_close(1, 2, 14) {
            Err(AbiError::Runtime { call, source }) => {
                assert_eq!(call, AbiCall::GrpcClose);
                assert_eq!(source.to_string(), "wasm trap: unreachable");
            }
            other => panic!("Expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_code_call_without_result() {
        let (mut abi, _) = dispatcher();

        match abi.proxy_on_configure(1, 0) {
            Err(AbiError::MissingResult { call }) => assert_eq!(call, AbiCall::Configure),
            other => panic!("Expected MissingResult, got {:?}", other),
        }
    }

    #[test]
    fn test_exported_calls() {
        let (abi, _) = dispatcher();
        let exported: Vec<_> = abi.exported_calls().collect();
        assert_eq!(exported.len(), AbiCall::COUNT - 1);
        assert!(!exported.contains(&AbiCall::Tick));
    }
}
