/* The sensor state registry: typed, timestamped parameter values for
 * every attached sensor.
 *
 * Writer discipline: the link RX task is the only writer of
 * device-originated values (`apply_device_update`); the consumer
 * interface is the only writer of host-originated values (`write`).
 * Host writes mark the slot dirty; the link TX task drains the dirty
 * set into a single coalesced DeviceWrite. */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::RuntimeError;
use crate::schema::{DeviceSchema, DeviceType, ParamValue, Uid, Value};

/* One parameter slot: current value, monotonic last-modified time and
 * the pending-write flag. */
#[derive(Debug, Clone)]
struct ParamSlot {
    value: Value,
    last_modified: f64,
    dirty: bool,
}

struct SensorEntry {
    device_type: Arc<DeviceType>,
    delay_ms: u16,
    slots: Vec<ParamSlot>,
}

/* A read-only view of one sensor, as handed to RPC consumers. */
#[derive(Debug, Clone)]
pub struct SensorSnapshot {
    pub uid: Uid,
    pub type_id: u16,
    pub type_name: String,
    pub delay_ms: u16,
    /* (name, value, last_modified) for every readable parameter. */
    pub params: Vec<(String, Value, f64)>,
}

pub struct SensorRegistry {
    schema: Arc<DeviceSchema>,
    epoch: Instant,
    sensors: RwLock<HashMap<Uid, SensorEntry>>,
}

impl SensorRegistry {
    pub fn new(schema: Arc<DeviceSchema>) -> Self {
        Self {
            schema,
            epoch: Instant::now(),
            sensors: RwLock::new(HashMap::new()),
        }
    }

    /* Seconds since registry start, monotonic. All `last_modified`
     * values are on this clock. */
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn schema(&self) -> &Arc<DeviceSchema> {
        &self.schema
    }

    /* Idempotent: a second registration of a live uid is a no-op, so a
     * reconnecting sensor keeps its state. */
    pub async fn register(&self, uid: Uid) -> Result<(), RuntimeError> {
        let device_type = self.schema.get(uid.device_type()).ok_or_else(|| {
            RuntimeError::violation(
                crate::message::MSG_SUBSCRIPTION_RESPONSE,
                format!("unknown device type {:#06x}", uid.device_type()),
            )
        })?;

        let mut sensors = self.sensors.write().await;
        if sensors.contains_key(&uid) {
            return Ok(());
        }
        let now = self.now();
        let slots = device_type
            .params
            .iter()
            .map(|param| ParamSlot {
                value: param.initial_value(),
                last_modified: now,
                dirty: false,
            })
            .collect();
        sensors.insert(
            uid,
            SensorEntry {
                device_type,
                delay_ms: 0,
                slots,
            },
        );
        debug!(uid = %uid, "registered sensor");
        Ok(())
    }

    /* Atomic removal; readers see the old entry or none. */
    pub async fn unregister(&self, uid: Uid) -> bool {
        let removed = self.sensors.write().await.remove(&uid).is_some();
        if removed {
            debug!(uid = %uid, "unregistered sensor");
        }
        removed
    }

    pub async fn contains(&self, uid: Uid) -> bool {
        self.sensors.read().await.contains_key(&uid)
    }

    pub async fn uids(&self) -> Vec<Uid> {
        self.sensors.read().await.keys().copied().collect()
    }

    pub async fn device_type(&self, uid: Uid) -> Option<Arc<DeviceType>> {
        self.sensors
            .read()
            .await
            .get(&uid)
            .map(|entry| Arc::clone(&entry.device_type))
    }

    /* Host-side write. Validates writability, type, numeric bounds and
     * the choice list; a rejection leaves the slot untouched. */
    pub async fn write(&self, uid: Uid, name: &str, value: ParamValue) -> Result<(), RuntimeError> {
        let now = self.now();
        let mut sensors = self.sensors.write().await;
        let entry = sensors
            .get_mut(&uid)
            .ok_or_else(|| RuntimeError::validation(name, format!("unknown uid {uid}")))?;
        let index = entry
            .device_type
            .param_index(name)
            .ok_or_else(|| RuntimeError::validation(name, "no such parameter"))?;
        let param = &entry.device_type.params[index];

        if !param.writable {
            return Err(RuntimeError::validation(name, "parameter is read-only"));
        }
        let value = param
            .scalar_type
            .coerce(value)
            .map_err(|reason| RuntimeError::validation(name, reason))?;
        if let Some(numeric) = value.as_f64() {
            if numeric < param.lower || numeric > param.upper {
                return Err(RuntimeError::validation(
                    name,
                    format!(
                        "value {numeric} not in bounds [{}, {}]",
                        param.lower, param.upper
                    ),
                ));
            }
        }
        if !param.choices.is_empty() {
            let legal = param
                .choices
                .iter()
                .any(|choice| param.scalar_type.coerce(*choice).ok() == Some(value));
            if !legal {
                return Err(RuntimeError::validation(name, "value is not a valid choice"));
            }
        }

        let slot = &mut entry.slots[index];
        slot.value = value;
        slot.last_modified = slot.last_modified.max(now);
        slot.dirty = true;
        Ok(())
    }

    /* Device-side update from a decoded DeviceData. No validation: the
     * sensor is authoritative for its own readings. */
    pub async fn apply_device_update(&self, uid: Uid, values: &[(usize, Value)]) {
        let now = self.now();
        let mut sensors = self.sensors.write().await;
        let Some(entry) = sensors.get_mut(&uid) else {
            return;
        };
        for (index, value) in values {
            if let Some(slot) = entry.slots.get_mut(*index) {
                slot.value = *value;
                slot.last_modified = slot.last_modified.max(now);
            }
        }
    }

    pub async fn set_delay(&self, uid: Uid, delay_ms: u16) {
        if let Some(entry) = self.sensors.write().await.get_mut(&uid) {
            entry.delay_ms = delay_ms;
        }
    }

    /* Read one readable parameter: value and last-modified time. */
    pub async fn read(&self, uid: Uid, name: &str) -> Result<(Value, f64), RuntimeError> {
        let sensors = self.sensors.read().await;
        let entry = sensors
            .get(&uid)
            .ok_or_else(|| RuntimeError::validation(name, format!("unknown uid {uid}")))?;
        let index = entry
            .device_type
            .param_index(name)
            .ok_or_else(|| RuntimeError::validation(name, "no such parameter"))?;
        if !entry.device_type.params[index].readable {
            return Err(RuntimeError::validation(name, "parameter is not readable"));
        }
        let slot = &entry.slots[index];
        Ok((slot.value, slot.last_modified))
    }

    /* All readable parameters of one sensor. */
    pub async fn snapshot(&self, uid: Uid) -> Result<SensorSnapshot, RuntimeError> {
        let sensors = self.sensors.read().await;
        let entry = sensors
            .get(&uid)
            .ok_or_else(|| RuntimeError::validation(uid.to_hex(), "unknown uid"))?;
        let params = entry
            .device_type
            .params
            .iter()
            .zip(&entry.slots)
            .filter(|(param, _)| param.readable)
            .map(|(param, slot)| (param.name.clone(), slot.value, slot.last_modified))
            .collect();
        Ok(SensorSnapshot {
            uid,
            type_id: entry.device_type.id,
            type_name: entry.device_type.name.clone(),
            delay_ms: entry.delay_ms,
            params,
        })
    }

    /* Drain the dirty set: returns the pending host writes in index
     * order and clears their flags. Consecutive writes between drains
     * coalesce into this one result. */
    pub async fn take_dirty(&self, uid: Uid) -> Vec<(usize, Value)> {
        let mut sensors = self.sensors.write().await;
        let Some(entry) = sensors.get_mut(&uid) else {
            return Vec::new();
        };
        let mut pending = Vec::new();
        for (index, slot) in entry.slots.iter_mut().enumerate() {
            if slot.dirty {
                slot.dirty = false;
                pending.push((index, slot.value));
            }
        }
        pending
    }
}
