// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SPA pod encoding for node `Props` and filter port formats.

use crate::audio::types::PropsUpdate;
use libspa::param::audio::{AudioFormat, AudioInfoRaw};
use libspa::param::ParamType;
use libspa::pod::deserialize::PodDeserializer;
use libspa::pod::serialize::PodSerializer;
use libspa::pod::{Object, Pod, Property, PropertyFlags, Value, ValueArray};
use libspa::utils::SpaTypes;
use std::io::Cursor;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Failed to serialize pod: {0}")]
    SerializationFailed(String),
    #[error("Nothing to write")]
    Empty,
}

/// Serialize the fields present in `props` as one `Props` object.
pub fn build_props_pod(props: &PropsUpdate) -> Result<Vec<u8>, ControlError> {
    if props.is_empty() {
        return Err(ControlError::Empty);
    }

    let mut properties = Vec::new();
    if let Some(volume) = props.volume {
        properties.push(Property {
            key: libspa::sys::SPA_PROP_volume,
            flags: PropertyFlags::empty(),
            value: Value::Float(volume),
        });
    }
    if let Some(muted) = props.mute {
        properties.push(Property {
            key: libspa::sys::SPA_PROP_mute,
            flags: PropertyFlags::empty(),
            value: Value::Bool(muted),
        });
    }
    if let Some(volumes) = &props.channel_volumes {
        properties.push(Property {
            key: libspa::sys::SPA_PROP_channelVolumes,
            flags: PropertyFlags::empty(),
            value: Value::ValueArray(ValueArray::Float(volumes.clone())),
        });
    }
    trace!("Building props pod: {:?}", props);

    serialize(Value::Object(Object {
        type_: SpaTypes::ObjectParamProps.as_raw(),
        id: ParamType::Props.as_raw(),
        properties,
    }))
}

/// `EnumFormat` for an interleaved F32 port.
pub fn build_format_pod(rate: u32, channels: u32) -> Result<Vec<u8>, ControlError> {
    let mut info = AudioInfoRaw::new();
    info.set_format(AudioFormat::F32LE);
    info.set_rate(rate);
    info.set_channels(channels);

    serialize(Value::Object(Object {
        type_: SpaTypes::ObjectParamFormat.as_raw(),
        id: ParamType::EnumFormat.as_raw(),
        properties: info.into(),
    }))
}

/// Read volume/mute fields from a `Props` parameter. `None` for blobs that
/// are not a props object or carry none of the fields.
pub fn parse_props_pod(pod: &Pod) -> Option<PropsUpdate> {
    let (_, value) = PodDeserializer::deserialize_any_from(pod.as_bytes()).ok()?;
    parse_props_value(&value)
}

pub fn parse_props_value(value: &Value) -> Option<PropsUpdate> {
    let Value::Object(object) = value else {
        return None;
    };

    let mut update = PropsUpdate::default();
    for property in &object.properties {
        match (property.key, &property.value) {
            (libspa::sys::SPA_PROP_volume, Value::Float(v)) if v.is_finite() => {
                update.volume = Some(*v)
            }
            (libspa::sys::SPA_PROP_mute, Value::Bool(m)) => update.mute = Some(*m),
            (libspa::sys::SPA_PROP_channelVolumes, Value::ValueArray(ValueArray::Float(v)))
                if v.iter().all(|x| x.is_finite()) =>
            {
                update.channel_volumes = Some(v.clone())
            }
            _ => {}
        }
    }

    (!update.is_empty()).then_some(update)
}

fn serialize(value: Value) -> Result<Vec<u8>, ControlError> {
    let (cursor, _) = PodSerializer::serialize(Cursor::new(Vec::new()), &value)
        .map_err(|e| ControlError::SerializationFailed(format!("{:?}", e)))?;
    Ok(cursor.into_inner())
}
