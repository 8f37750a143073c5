//! Reuse signatures
//!
//! A signature fingerprints everything that must match for a cache
//! directory to be reusable: the device, the driver and toolkit, the
//! serving stack component versions, the source revision, the model and
//! the serving parameters that shape kernels. Equality is exact — a stored
//! signature that differs in any field, carries extra fields or fails to
//! parse simply does not match.

use crate::cache::CacheClass;
use crate::config::schema::ServerConfig;
use crate::environment::EnvSnapshot;
use crate::error::KilnResult;
use crate::jsonio;
use serde_json::{Map, Value};
use std::path::Path;

/// File name of the persisted signature inside a cache directory
pub const SIGNATURE_FILE: &str = "signature.json";

/// Computed reuse fingerprint for one artifact class
#[derive(Debug, Clone, PartialEq)]
pub struct Signature(Map<String, Value>);

impl Signature {
    /// Compute the signature for `class` from its inputs.
    ///
    /// Pure function of its arguments; the per-class field selection is
    /// deliberate: compilation caches do not care about flashinfer's
    /// version, warm-up caches do.
    pub fn compute(
        class: CacheClass,
        env: &EnvSnapshot,
        model_slug: &str,
        tp: u32,
        server: &ServerConfig,
        moe_dtype: Option<&str>,
    ) -> Self {
        let mut fields = Map::new();
        let mut put = |key: &str, value: Value| {
            fields.insert(key.to_string(), value);
        };

        put("model_slug", Value::from(model_slug));
        put("tp", Value::from(tp));
        put("device_name", Value::from(env.device_name.as_str()));
        put(
            "compute_capability",
            Value::from(env.compute_capability.as_str()),
        );
        put("cuda", Value::from(env.cuda.as_str()));
        put("driver_version", Value::from(env.driver_version.as_str()));
        put("torch_version", Value::from(env.torch_version.as_str()));
        put("triton_version", Value::from(env.triton_version.as_str()));
        put(
            "source_revision",
            Value::from(env.source_revision.as_str()),
        );

        match class {
            CacheClass::DeepGemm => {
                put("kv_cache_dtype", Value::from(server.kv_cache_dtype.as_str()));
                put("mem_fraction_static", Value::from(server.mem_fraction_static));
                put("chunked_prefill_size", Value::from(server.chunked_prefill_size));
                put("context_length", Value::from(server.context_length));
            }
            CacheClass::MoeTune => {
                put("dtype", Value::from(moe_dtype.unwrap_or("")));
            }
            CacheClass::Flashinfer | CacheClass::Inductor => {
                put(
                    "flashinfer_version",
                    Value::from(env.flashinfer_version.as_str()),
                );
                put("kv_cache_dtype", Value::from(server.kv_cache_dtype.as_str()));
                put("mem_fraction_static", Value::from(server.mem_fraction_static));
                put("chunked_prefill_size", Value::from(server.chunked_prefill_size));
                put("context_length", Value::from(server.context_length));
                put("max_prefill_tokens", Value::from(server.max_prefill_tokens));
                put("max_total_tokens", Value::from(server.max_total_tokens));
                put(
                    "torch_compile",
                    Value::from(matches!(class, CacheClass::Inductor)),
                );
            }
        }

        Self(fields)
    }

    /// The signature as a JSON value, field order as computed
    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Persist wholesale via the atomic writer
    pub fn persist(&self, path: &Path) -> KilnResult<()> {
        jsonio::atomic_write_json(path, &self.as_value())
    }

    /// Whether the signature stored at `path` matches this one exactly.
    ///
    /// Missing, unreadable or unparseable files are a mismatch, never an
    /// error — the caller regenerates in all of those cases.
    pub fn matches_persisted(&self, path: &Path) -> bool {
        match jsonio::read_json_value(path) {
            Ok(stored) => stored == self.as_value(),
            Err(_) => false,
        }
    }
}
