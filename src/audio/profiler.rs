// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Binding for the server's `Profiler` global.
//!
//! pipewire-rs has no proxy type for the profiler, so this module supplies
//! one and hooks the `profile` event directly. Each event carries a struct
//! of profiler objects; the last one is decoded into a [`ProfilerSnapshot`].

use crate::audio::types::{NodeTiming, ProfilerSnapshot};
use libspa::pod::deserialize::PodDeserializer;
use libspa::pod::{Pod, Value};
use pipewire::proxy::{Proxy, ProxyT};
use pipewire::types::ObjectType;
use std::ffi::c_void;
use std::mem;
use tracing::{debug, trace};

const SPA_PROFILER_INFO: u32 = 0x10001;
const SPA_PROFILER_CLOCK: u32 = 0x10002;
const SPA_PROFILER_DRIVER_BLOCK: u32 = 0x10003;
const SPA_PROFILER_FOLLOWER_BLOCK: u32 = 0x20001;

/// Decode one `profile` event payload.
pub fn parse_profile(value: &Value) -> Option<ProfilerSnapshot> {
    let object = match value {
        Value::Object(object) => object,
        Value::Struct(items) => items.iter().rev().find_map(|v| match v {
            Value::Object(object) => Some(object),
            _ => None,
        })?,
        _ => return None,
    };

    let mut snapshot = ProfilerSnapshot::default();
    let mut seen_info = false;
    for property in &object.properties {
        let Value::Struct(fields) = &property.value else {
            continue;
        };
        match property.key {
            SPA_PROFILER_INFO => {
                snapshot.counter = long(fields, 0).unwrap_or(0).max(0) as u64;
                for (i, load) in snapshot.cpu_load.iter_mut().enumerate() {
                    *load = float(fields, 1 + i).unwrap_or(0.0);
                }
                snapshot.xrun_count = int(fields, 4).unwrap_or(0);
                seen_info = true;
            }
            SPA_PROFILER_CLOCK => {
                if let Some(Value::Fraction(rate)) = fields.get(4) {
                    snapshot.clock_rate = rate.denom;
                }
                snapshot.clock_duration = long(fields, 6).unwrap_or(0).max(0) as u64;
            }
            SPA_PROFILER_DRIVER_BLOCK => snapshot.driver = parse_block(fields),
            SPA_PROFILER_FOLLOWER_BLOCK => {
                if let Some(block) = parse_block(fields) {
                    snapshot.followers.push(block);
                }
            }
            other => trace!("Ignoring profiler property {:#x}", other),
        }
    }

    seen_info.then_some(snapshot)
}

fn parse_block(fields: &[Value]) -> Option<NodeTiming> {
    Some(NodeTiming {
        id: int(fields, 0)?.max(0) as u32,
        name: match fields.get(1) {
            Some(Value::String(name)) => name.clone(),
            _ => String::new(),
        },
        prev_signal: long(fields, 2)?,
        signal: long(fields, 3)?,
        awake: long(fields, 4)?,
        finish: long(fields, 5)?,
        status: int(fields, 6).unwrap_or(0),
        // Older servers end the block before the xrun counter.
        xrun_count: int(fields, 8).unwrap_or(0),
    })
}

fn long(fields: &[Value], index: usize) -> Option<i64> {
    match fields.get(index)? {
        Value::Long(v) => Some(*v),
        Value::Int(v) => Some(i64::from(*v)),
        _ => None,
    }
}

fn int(fields: &[Value], index: usize) -> Option<i32> {
    match fields.get(index)? {
        Value::Int(v) => Some(*v),
        _ => None,
    }
}

fn float(fields: &[Value], index: usize) -> Option<f32> {
    match fields.get(index)? {
        Value::Float(v) => Some(*v),
        Value::Double(v) => Some(*v as f32),
        _ => None,
    }
}

/// Proxy for a bound `PipeWire:Interface:Profiler` global.
pub struct ProfilerProxy {
    proxy: Proxy,
}

impl ProxyT for ProfilerProxy {
    fn type_() -> ObjectType {
        ObjectType::Profiler
    }

    fn upcast(self) -> Proxy {
        self.proxy
    }

    fn upcast_ref(&self) -> &Proxy {
        &self.proxy
    }

    unsafe fn from_proxy_unchecked(proxy: Proxy) -> Self {
        Self { proxy }
    }
}

#[repr(C)]
struct ProfilerEvents {
    version: u32,
    profile: Option<unsafe extern "C" fn(data: *mut c_void, pod: *const libspa::sys::spa_pod)>,
}

static PROFILER_EVENTS: ProfilerEvents = ProfilerEvents {
    version: 0,
    profile: Some(on_profile),
};

type ProfileCallback = Box<dyn Fn(ProfilerSnapshot)>;

/// A bound profiler plus its registered `profile` listener.
pub struct ProfilerBinding {
    // Dropped first: destroying the proxy cleans its listener list before
    // the hook and callback are freed.
    _proxy: ProfilerProxy,
    _hook: Box<libspa::sys::spa_hook>,
    _callback: Box<ProfileCallback>,
}

impl ProfilerBinding {
    pub fn new(proxy: ProfilerProxy, callback: impl Fn(ProfilerSnapshot) + 'static) -> Self {
        // SAFETY: an all-zero spa_hook is the unlinked state.
        let mut hook: Box<libspa::sys::spa_hook> = Box::new(unsafe { mem::zeroed() });
        let mut callback: Box<ProfileCallback> = Box::new(Box::new(callback));

        // SAFETY: hook and callback are boxed and outlive the proxy; the
        // events table is static.
        unsafe {
            pipewire::sys::pw_proxy_add_object_listener(
                proxy.upcast_ref().as_ptr(),
                hook.as_mut(),
                &PROFILER_EVENTS as *const ProfilerEvents as *const c_void,
                callback.as_mut() as *mut ProfileCallback as *mut c_void,
            );
        }
        debug!("Profiler listener registered");

        Self {
            _proxy: proxy,
            _hook: hook,
            _callback: callback,
        }
    }
}

unsafe extern "C" fn on_profile(data: *mut c_void, pod: *const libspa::sys::spa_pod) {
    if data.is_null() || pod.is_null() {
        return;
    }
    let callback = &*(data as *const ProfileCallback);
    let pod = Pod::from_raw(pod);
    match PodDeserializer::deserialize_any_from(pod.as_bytes()) {
        Ok((_, value)) => {
            if let Some(snapshot) = parse_profile(&value) {
                callback(snapshot);
            }
        }
        Err(e) => trace!("Undecodable profiler pod: {:?}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libspa::pod::{Object, Property, PropertyFlags};
    use libspa::utils::Fraction;

    fn prop(key: u32, fields: Vec<Value>) -> Property {
        Property {
            key,
            flags: PropertyFlags::empty(),
            value: Value::Struct(fields),
        }
    }

    fn block(id: i32, name: &str, xruns: i32) -> Vec<Value> {
        vec![
            Value::Int(id),
            Value::String(name.into()),
            Value::Long(100),
            Value::Long(200),
            Value::Long(250),
            Value::Long(400),
            Value::Int(3),
            Value::Fraction(Fraction { num: 1024, denom: 48_000 }),
            Value::Int(xruns),
        ]
    }

    fn profile() -> Value {
        Value::Struct(vec![Value::Object(Object {
            type_: 0,
            id: 0,
            properties: vec![
                prop(
                    SPA_PROFILER_INFO,
                    vec![
                        Value::Long(42),
                        Value::Float(0.1),
                        Value::Float(0.2),
                        Value::Float(0.3),
                        Value::Int(7),
                    ],
                ),
                prop(
                    SPA_PROFILER_CLOCK,
                    vec![
                        Value::Int(0),
                        Value::Int(30),
                        Value::String("alsa".into()),
                        Value::Long(0),
                        Value::Fraction(Fraction { num: 1, denom: 48_000 }),
                        Value::Long(0),
                        Value::Long(1024),
                    ],
                ),
                prop(SPA_PROFILER_DRIVER_BLOCK, block(30, "alsa_output", 1)),
                prop(SPA_PROFILER_FOLLOWER_BLOCK, block(55, "firefox", 0)),
                prop(SPA_PROFILER_FOLLOWER_BLOCK, block(56, "mpv", 2)),
            ],
        })])
    }

    #[test]
    fn test_parse_profile() {
        let snapshot = parse_profile(&profile()).unwrap();
        assert_eq!(snapshot.counter, 42);
        assert_eq!(snapshot.xrun_count, 7);
        assert_eq!(snapshot.clock_rate, 48_000);
        assert_eq!(snapshot.clock_duration, 1024);
        let driver = snapshot.driver.unwrap();
        assert_eq!(driver.name, "alsa_output");
        assert_eq!(driver.busy_ns(), 150);
        assert_eq!(snapshot.followers.len(), 2);
        assert_eq!(snapshot.followers[1].xrun_count, 2);
    }

    #[test]
    fn test_short_block_keeps_defaults() {
        let mut fields = block(9, "old", 0);
        fields.truncate(7);
        let timing = parse_block(&fields).unwrap();
        assert_eq!(timing.xrun_count, 0);
        assert!(parse_block(&fields[..3]).is_none());
    }

    #[test]
    fn test_without_info_is_rejected() {
        assert!(parse_profile(&Value::Struct(vec![])).is_none());
        assert!(parse_profile(&Value::Int(1)).is_none());
    }
}
