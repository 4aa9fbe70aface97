// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Native `pw_filter` behind a [`BiquadFilterNode`](crate::eq::BiquadFilterNode).
//!
//! Lives on the PipeWire loop thread. The process callback runs on the
//! data thread and only touches [`FilterShared`] and the port table, which
//! is fixed before the filter connects.

use crate::audio::control::build_format_pod;
use crate::eq::filter_node::{FilterError, FilterRequest, FilterShared, FilterState};
use crate::eq::layout::{PortLayout, INTERLEAVED_LABEL};
use libspa::param::audio::AudioInfoRaw;
use libspa::pod::Pod;
use libspa::utils::Direction;
use pipewire::properties::properties;
use pipewire::sys as pw_sys;
use std::ffi::{c_char, c_void, CStr, CString};
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const SAMPLE_BYTES: usize = mem::size_of::<f32>();

struct PortPair {
    input: *mut c_void,
    output: *mut c_void,
    channels: usize,
}

/// Callback data. Boxed so its address is stable for the C side.
struct FilterData {
    filter: *mut pw_sys::pw_filter,
    shared: Arc<FilterShared>,
    ports: Vec<PortPair>,
    rate: AtomicU32,
}

pub struct NativeFilter {
    raw: NonNull<pw_sys::pw_filter>,
    _hook: Box<libspa::sys::spa_hook>,
    _events: Box<pw_sys::pw_filter_events>,
    _data: Box<FilterData>,
}

impl NativeFilter {
    /// Create the filter, register its ports and connect it. Runs on the
    /// loop thread.
    pub fn create(
        core: &pipewire::core::CoreRc,
        request: &FilterRequest,
        shared: Arc<FilterShared>,
    ) -> Result<Self, FilterError> {
        let total_channels: usize = request.layout.iter().map(|l| l.channels).sum();
        let name = CString::new(request.name.as_str())
            .map_err(|e| FilterError::CreateFailed(e.to_string()))?;
        let props = properties! {
            "media.type" => "Audio",
            "media.category" => "Filter",
            "media.role" => "DSP",
            "node.name" => request.name.clone(),
            "node.description" => request.description.clone(),
            "node.rate" => format!("1/{}", request.sample_rate),
            "node.autoconnect" => "false",
            "audio.channels" => total_channels.to_string()
        };

        // SAFETY: the core pointer is valid for the duration of the call and
        // ownership of the properties passes to the filter.
        let raw = unsafe {
            pw_sys::pw_filter_new(core.as_raw_ptr(), name.as_ptr(), props.into_raw())
        };
        let raw = NonNull::new(raw).ok_or_else(|| {
            FilterError::CreateFailed(format!("pw_filter_new failed for '{}'", request.name))
        })?;

        let mut data = Box::new(FilterData {
            filter: raw.as_ptr(),
            shared: shared.clone(),
            ports: Vec::with_capacity(request.layout.len()),
            rate: AtomicU32::new(request.sample_rate),
        });

        // SAFETY: zeroed is the unlinked hook / "no callback" table.
        let mut hook: Box<libspa::sys::spa_hook> = Box::new(unsafe { mem::zeroed() });
        let mut events: Box<pw_sys::pw_filter_events> = Box::new(unsafe { mem::zeroed() });
        events.version = pw_sys::PW_VERSION_FILTER_EVENTS;
        events.state_changed = Some(on_state_changed);
        events.param_changed = Some(on_param_changed);
        events.process = Some(on_process);

        // SAFETY: hook, events and data are boxed and owned by the returned
        // value, which destroys the filter before freeing them.
        unsafe {
            pw_sys::pw_filter_add_listener(
                raw.as_ptr(),
                hook.as_mut(),
                events.as_ref(),
                data.as_mut() as *mut FilterData as *mut c_void,
            );
        }

        // Assemble the owner now so a failure below still destroys the filter.
        let mut ports = Vec::with_capacity(request.layout.len());
        let add_result = request.layout.iter().try_for_each(|layout| {
            let rate = request.sample_rate;
            let (in_name, out_name) = (layout.input_port_name(), layout.output_port_name());
            let input = add_port(raw, Direction::Input, &in_name, layout, rate)?;
            let output = add_port(raw, Direction::Output, &out_name, layout, rate)?;
            ports.push(PortPair {
                input,
                output,
                channels: layout.channels,
            });
            Ok::<(), FilterError>(())
        });
        data.ports = ports;

        let filter = Self {
            raw,
            _hook: hook,
            _events: events,
            _data: data,
        };
        add_result?;

        // SAFETY: raw is a live filter; no connect params.
        let res = unsafe {
            pw_sys::pw_filter_connect(
                raw.as_ptr(),
                pw_sys::pw_filter_flags_PW_FILTER_FLAG_RT_PROCESS,
                ptr::null_mut(),
                0,
            )
        };
        if res < 0 {
            return Err(FilterError::CreateFailed(format!(
                "pw_filter_connect failed: {}",
                res
            )));
        }

        info!(
            "Native filter '{}' connecting ({} port pair(s), {} channel(s))",
            request.name,
            request.layout.len(),
            total_channels
        );
        Ok(filter)
    }
}

impl Drop for NativeFilter {
    fn drop(&mut self) {
        debug!("Destroying native filter {:?}", self.raw);
        // SAFETY: raw is live until here; listeners are cleaned by destroy,
        // before the boxed callback data is freed.
        unsafe { pw_sys::pw_filter_destroy(self.raw.as_ptr()) };
    }
}

fn add_port(
    filter: NonNull<pw_sys::pw_filter>,
    direction: Direction,
    port_name: &str,
    layout: &PortLayout,
    rate: u32,
) -> Result<*mut c_void, FilterError> {
    let mut props = properties! {
        "port.name" => port_name
    };
    if layout.channels == 1 {
        props.insert("format.dsp", "32 bit float mono audio");
    }
    if layout.label != INTERLEAVED_LABEL {
        props.insert("audio.channel", layout.label.as_str());
    }

    // Interleaved ports negotiate a raw F32 format; mono ports use DSP format.
    let format = if layout.channels > 1 {
        Some(
            build_format_pod(rate, layout.channels as u32)
                .map_err(|e| FilterError::CreateFailed(e.to_string()))?,
        )
    } else {
        None
    };
    let mut params: Vec<*const libspa::sys::spa_pod> = format
        .iter()
        .map(|bytes| bytes.as_ptr() as *const libspa::sys::spa_pod)
        .collect();

    // SAFETY: filter is live; params point into `format`, alive for the call.
    let port = unsafe {
        pw_sys::pw_filter_add_port(
            filter.as_ptr(),
            direction.as_raw(),
            pw_sys::pw_filter_port_flags_PW_FILTER_PORT_FLAG_MAP_BUFFERS,
            0,
            props.into_raw(),
            params.as_mut_ptr(),
            params.len() as u32,
        )
    };
    if port.is_null() {
        return Err(FilterError::CreateFailed(format!(
            "Failed to add port '{}'",
            port_name
        )));
    }
    Ok(port)
}

unsafe extern "C" fn on_state_changed(
    data: *mut c_void,
    _old: pw_sys::pw_filter_state,
    state: pw_sys::pw_filter_state,
    error: *const c_char,
) {
    let Some(data) = (data as *const FilterData).as_ref() else {
        return;
    };
    let new_state = match state {
        pw_sys::pw_filter_state_PW_FILTER_STATE_ERROR => {
            let message = if error.is_null() {
                "unknown error".to_string()
            } else {
                CStr::from_ptr(error).to_string_lossy().into_owned()
            };
            FilterState::Error(message)
        }
        pw_sys::pw_filter_state_PW_FILTER_STATE_UNCONNECTED => FilterState::Unconnected,
        pw_sys::pw_filter_state_PW_FILTER_STATE_CONNECTING => FilterState::Connecting,
        pw_sys::pw_filter_state_PW_FILTER_STATE_PAUSED => FilterState::Paused,
        pw_sys::pw_filter_state_PW_FILTER_STATE_STREAMING => FilterState::Streaming,
        _ => return,
    };

    if matches!(new_state, FilterState::Paused | FilterState::Streaming) {
        let id = pw_sys::pw_filter_get_node_id(data.filter);
        if id != libspa::sys::SPA_ID_INVALID {
            data.shared.set_node_id(id);
        }
    }
    data.shared.set_state(new_state);
}

unsafe extern "C" fn on_param_changed(
    data: *mut c_void,
    port_data: *mut c_void,
    id: u32,
    param: *const libspa::sys::spa_pod,
) {
    if port_data.is_null() || param.is_null() || id != libspa::sys::SPA_PARAM_Format {
        return;
    }
    let Some(data) = (data as *const FilterData).as_ref() else {
        return;
    };

    let mut info = AudioInfoRaw::new();
    if info.parse(Pod::from_raw(param)).is_ok() && info.rate() > 0 {
        data.rate.store(info.rate(), Ordering::Relaxed);
        data.shared.set_sample_rate(info.rate());
    }
}

unsafe extern "C" fn on_process(data: *mut c_void, position: *mut libspa::sys::spa_io_position) {
    let Some(data) = (data as *const FilterData).as_ref() else {
        return;
    };

    if let Some(position) = position.as_ref() {
        let rate = position.clock.rate.denom;
        if rate != 0 && rate != data.rate.load(Ordering::Relaxed) {
            data.rate.store(rate, Ordering::Relaxed);
            data.shared.set_sample_rate_rt(rate);
        }
    }

    for (index, pair) in data.ports.iter().enumerate() {
        let in_buf = pw_sys::pw_filter_dequeue_buffer(pair.input);
        let out_buf = pw_sys::pw_filter_dequeue_buffer(pair.output);

        if !in_buf.is_null() && !out_buf.is_null() {
            process_pair(
                &data.shared,
                index,
                pair.channels,
                input_samples(in_buf),
                output_samples(out_buf),
            );
        }

        if !in_buf.is_null() {
            pw_sys::pw_filter_queue_buffer(pair.input, in_buf);
        }
        if !out_buf.is_null() {
            pw_sys::pw_filter_queue_buffer(pair.output, out_buf);
        }
    }
}

/// Filter one port pair into its output chunk. When either side is
/// unusable nothing is written and both buffers go back untouched.
fn process_pair(
    shared: &FilterShared,
    index: usize,
    channels: usize,
    input: Option<&[f32]>,
    output: Option<(&mut [f32], &mut libspa::sys::spa_chunk)>,
) -> bool {
    let (Some(input), Some((output, chunk))) = (input, output) else {
        return false;
    };
    let written = shared.process_port(index, input, output);
    chunk.offset = 0;
    chunk.size = (written * SAMPLE_BYTES) as u32;
    chunk.stride = (channels * SAMPLE_BYTES) as i32;
    true
}

/// Valid samples of an input buffer's first data plane.
unsafe fn input_samples<'a>(buf: *mut pw_sys::pw_buffer) -> Option<&'a [f32]> {
    let spa_buf = (*buf).buffer.as_ref()?;
    if spa_buf.n_datas == 0 {
        return None;
    }
    let d = spa_buf.datas.as_ref()?;
    let chunk = d.chunk.as_ref()?;
    if d.data.is_null() {
        return None;
    }
    let maxsize = d.maxsize as usize;
    let offset = (chunk.offset as usize).min(maxsize);
    let size = (chunk.size as usize).min(maxsize - offset);
    let bytes = slice::from_raw_parts((d.data as *const u8).add(offset), size);
    bytemuck::try_cast_slice(bytes).ok()
}

/// Whole writable area of an output buffer plus its chunk.
unsafe fn output_samples<'a>(
    buf: *mut pw_sys::pw_buffer,
) -> Option<(&'a mut [f32], &'a mut libspa::sys::spa_chunk)> {
    let spa_buf = (*buf).buffer.as_ref()?;
    if spa_buf.n_datas == 0 {
        return None;
    }
    let d = spa_buf.datas.as_ref()?;
    if d.data.is_null() {
        return None;
    }
    let chunk = d.chunk.as_mut()?;
    let bytes = slice::from_raw_parts_mut(d.data as *mut u8, d.maxsize as usize);
    let samples = bytemuck::try_cast_slice_mut(bytes).ok()?;
    Some((samples, chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eqsplice_dsp::EqPreset;

    fn chunk(size: u32) -> libspa::sys::spa_chunk {
        // SAFETY: spa_chunk is plain integers.
        let mut chunk: libspa::sys::spa_chunk = unsafe { mem::zeroed() };
        chunk.size = size;
        chunk
    }

    fn shared() -> FilterShared {
        let layout = [PortLayout::mono("FL")];
        FilterShared::new("f", &layout, &EqPreset::bass_boost(), 48_000)
    }

    #[test]
    fn test_pair_is_processed_when_both_sides_are_usable() {
        let shared = shared();
        let input = [0.25_f32; 16];
        let mut output = [0.0_f32; 32];
        let mut out_chunk = chunk(0);

        let output_side = Some((&mut output[..], &mut out_chunk));
        assert!(process_pair(&shared, 0, 1, Some(&input[..]), output_side));
        assert_eq!(out_chunk.size as usize, 16 * SAMPLE_BYTES);
        assert_eq!(out_chunk.stride as usize, SAMPLE_BYTES);
        assert!(output[..16].iter().any(|s| *s != 0.0));
    }

    #[test]
    fn test_unreadable_input_leaves_output_untouched() {
        let shared = shared();
        let mut output = [7.0_f32; 8];
        let mut out_chunk = chunk(123);

        let output_side = Some((&mut output[..], &mut out_chunk));
        assert!(!process_pair(&shared, 0, 1, None, output_side));
        assert_eq!(out_chunk.size, 123);
        assert!(output.iter().all(|s| *s == 7.0));
        assert!(shared.with_dsp(|d| d.is_reset()));
    }
}
