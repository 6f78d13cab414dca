//! Accelerator resource allocation.
//!
//! A mutex-guarded per-device ledger. Grants are atomic with respect to
//! concurrent requests, so the capacity invariant (sum of reserved units
//! never exceeds capacity minus the safety margin) holds under concurrency.
//! Release is idempotent: supervisor retries may release the same ticket
//! twice and the second call is a no-op.

use chrono::{DateTime, Utc};
use modelrack_core::error::{LaunchError, LaunchResult};
use modelrack_core::hardware::AcceleratorInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

/// Lease state of one live allocation ticket. Released tickets are dropped
/// from the ledger entirely, so they have no state to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Reserved while the worker is starting; counts against capacity.
    Pending,
    /// Worker reached ready with this reservation.
    Granted,
}

/// A lease record representing reserved device resources for one worker's
/// lifetime. Exactly one ticket per active worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationTicket {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub device: usize,
    pub units: u64,
}

#[derive(Debug)]
struct TicketRecord {
    device: usize,
    units: u64,
    state: LeaseState,
}

#[derive(Debug)]
struct DeviceLedger {
    capacity: u64,
    reserved: u64,
}

#[derive(Debug, Default)]
struct Inner {
    devices: Vec<DeviceLedger>,
    tickets: HashMap<Uuid, TicketRecord>,
}

/// Point-in-time usage of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUsage {
    pub ordinal: usize,
    pub capacity: u64,
    pub reserved: u64,
}

/// Snapshot of allocator state.
#[derive(Debug, Clone)]
pub struct AllocatorStatistics {
    pub devices: Vec<DeviceUsage>,
    pub active_tickets: usize,
    pub timestamp: DateTime<Utc>,
}

/// Tracks free capacity across devices and grants or denies reservations.
///
/// Never exposes raw counters; all updates go through [`request`],
/// [`confirm`], and [`release`].
///
/// [`request`]: DeviceAllocator::request
/// [`confirm`]: DeviceAllocator::confirm
/// [`release`]: DeviceAllocator::release
pub struct DeviceAllocator {
    inner: Mutex<Inner>,
    safety_margin: f64,
}

impl DeviceAllocator {
    /// Build an allocator over explicit per-device capacities.
    pub fn new(capacities: Vec<u64>, safety_margin: f64) -> Self {
        let devices = capacities
            .into_iter()
            .map(|capacity| DeviceLedger {
                capacity,
                reserved: 0,
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                devices,
                tickets: HashMap::new(),
            }),
            safety_margin,
        }
    }

    /// Derive capacities from detected hardware: 1 unit = 1 MiB of device
    /// memory, overridable with a fixed per-device value. Devices that report
    /// no memory (CPU fallback, missing SMI tool) fall back to system RAM.
    pub fn from_hardware(
        hardware: &AcceleratorInfo,
        capacity_override: Option<u64>,
        safety_margin: f64,
    ) -> Self {
        const MIB: u64 = 1024 * 1024;
        let capacities = hardware
            .devices
            .iter()
            .map(|d| {
                capacity_override.unwrap_or_else(|| {
                    let derived = d.memory_bytes / MIB;
                    if derived > 0 {
                        derived
                    } else {
                        (hardware.total_ram_bytes / MIB).max(1)
                    }
                })
            })
            .collect();
        Self::new(capacities, safety_margin)
    }

    /// Units a device holds back from allocation.
    fn margin_units(&self, capacity: u64) -> u64 {
        (capacity as f64 * self.safety_margin).ceil() as u64
    }

    /// Reserve `units` on the first device with room, returning a ticket in
    /// the `Pending` lease state.
    ///
    /// Rejects proactively when the request would cross into the safety
    /// margin band: recovering from an out-of-memory worker crash costs far
    /// more than denying up front.
    pub fn request(&self, worker_id: Uuid, units: u64) -> LaunchResult<AllocationTicket> {
        if units == 0 {
            return Err(LaunchError::Config("allocation of 0 units".to_string()));
        }

        let mut inner = self.inner.lock();
        let mut best_free = 0u64;
        for device in 0..inner.devices.len() {
            let ledger = &inner.devices[device];
            let usable = ledger.capacity.saturating_sub(self.margin_units(ledger.capacity));
            let free = usable.saturating_sub(ledger.reserved);
            if units <= free {
                inner.devices[device].reserved += units;
                let ticket = AllocationTicket {
                    id: Uuid::new_v4(),
                    worker_id,
                    device,
                    units,
                };
                inner.tickets.insert(
                    ticket.id,
                    TicketRecord {
                        device,
                        units,
                        state: LeaseState::Pending,
                    },
                );
                tracing::debug!(
                    ticket = %ticket.id,
                    worker = %worker_id,
                    device,
                    units,
                    "allocation granted"
                );
                return Ok(ticket);
            }
            best_free = best_free.max(free);
        }

        Err(LaunchError::ResourceExhausted(format!(
            "requested {units} units, best free {best_free} (safety margin {:.0}%)",
            self.safety_margin * 100.0
        )))
    }

    /// Move a pending ticket to `Granted` once its worker reaches ready.
    /// Returns false if the ticket is unknown or already released.
    pub fn confirm(&self, ticket_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        match inner.tickets.get_mut(&ticket_id) {
            Some(record) if record.state == LeaseState::Pending => {
                record.state = LeaseState::Granted;
                true
            }
            _ => false,
        }
    }

    /// Restore the ticket's capacity and forget the record. Exactly-once
    /// semantics: the first call releases, any later call finds no record and
    /// is a no-op returning false. Dead tickets are never retained, so the
    /// ledger stays bounded by the number of live workers regardless of how
    /// many launches the process has served.
    pub fn release(&self, ticket_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        let Some(record) = inner.tickets.remove(&ticket_id) else {
            return false;
        };
        inner.devices[record.device].reserved -= record.units;
        tracing::debug!(
            ticket = %ticket_id,
            device = record.device,
            units = record.units,
            "allocation released"
        );
        true
    }

    /// Current lease state of a live ticket. None once released or unknown.
    pub fn ticket_state(&self, ticket_id: Uuid) -> Option<LeaseState> {
        self.inner.lock().tickets.get(&ticket_id).map(|r| r.state)
    }

    pub fn statistics(&self) -> AllocatorStatistics {
        let inner = self.inner.lock();
        AllocatorStatistics {
            devices: inner
                .devices
                .iter()
                .enumerate()
                .map(|(ordinal, d)| DeviceUsage {
                    ordinal,
                    capacity: d.capacity,
                    reserved: d.reserved,
                })
                .collect(),
            active_tickets: inner.tickets.len(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
