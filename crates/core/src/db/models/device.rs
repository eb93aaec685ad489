use diesel::prelude::*;
use queuepay_types::{Device, DeviceStatus, HeartbeatReport, devices::UnknownDeviceStatus};
use tracing::debug;

use crate::db::{PooledConnection, schema::*};

pub fn find_device(
    conn: &mut PooledConnection,
    device_id: &str,
) -> QueryResult<Option<DeviceModel>> {
    devices::table
        .filter(devices::device_id.eq(device_id))
        .select(DeviceModel::as_select())
        .first(conn)
        .optional()
}

pub fn set_status(
    conn: &mut PooledConnection,
    device_id: &str,
    status: DeviceStatus,
) -> QueryResult<usize> {
    debug!("Setting device {} status to {}", device_id, status);
    diesel::update(devices::table.filter(devices::device_id.eq(device_id)))
        .set((
            devices::status.eq(status.as_str()),
            devices::updated_at.eq(chrono::Utc::now().timestamp_millis()),
        ))
        .execute(conn)
}

pub fn touch(conn: &mut PooledConnection, device_id: &str, seen_at: i64) -> QueryResult<usize> {
    diesel::update(devices::table.filter(devices::device_id.eq(device_id)))
        .set(devices::last_seen.eq(seen_at))
        .execute(conn)
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = devices)]
#[diesel(primary_key(device_id))]
pub struct DeviceModel {
    pub device_id: String,
    pub secret_key: String,
    pub status: String,
    pub establishment_id: Option<String>,
    pub last_seen: Option<i64>,
    pub uptime_seconds: Option<i64>,
    pub firmware_version: Option<String>,
    pub free_memory: Option<i64>,
    pub healthy: Option<bool>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<DeviceModel> for Device {
    type Error = UnknownDeviceStatus;

    fn try_from(model: DeviceModel) -> Result<Self, Self::Error> {
        Ok(Device {
            status: model.status.parse()?,
            device_id: model.device_id,
            secret_key: model.secret_key,
            establishment_id: model.establishment_id,
            last_seen: model.last_seen,
            uptime_seconds: model.uptime_seconds,
            firmware_version: model.firmware_version,
            free_memory: model.free_memory,
            healthy: model.healthy,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = devices)]
pub struct NewDevice<'a> {
    pub device_id: &'a str,
    pub secret_key: &'a str,
    pub status: &'a str,
    pub establishment_id: Option<&'a str>,
    pub firmware_version: Option<&'a str>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'a> NewDevice<'a> {
    /// Registered devices start DISABLED until explicitly activated
    pub fn disabled(
        device_id: &'a str,
        secret_key: &'a str,
        establishment_id: Option<&'a str>,
        firmware_version: Option<&'a str>,
    ) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis();
        Self {
            device_id,
            secret_key,
            status: DeviceStatus::Disabled.as_str(),
            establishment_id,
            firmware_version,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn insert(&self, conn: &mut PooledConnection) -> QueryResult<usize> {
        debug!("Registering device {}", self.device_id);
        diesel::insert_into(devices::table)
            .values(self)
            .execute(conn)
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = devices)]
pub struct DeviceHeartbeat<'a> {
    pub uptime_seconds: Option<i64>,
    pub firmware_version: Option<&'a str>,
    pub free_memory: Option<i64>,
    pub healthy: Option<bool>,
    pub last_seen: i64,
    pub updated_at: i64,
}

impl<'a> DeviceHeartbeat<'a> {
    pub fn from_report(report: &'a HeartbeatReport) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis();
        Self {
            uptime_seconds: report.uptime,
            firmware_version: report.firmware_version.as_deref(),
            free_memory: report.free_memory,
            healthy: report.healthy,
            last_seen: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn update(&self, conn: &mut PooledConnection, device_id: &str) -> QueryResult<usize> {
        debug!(
            "Recording heartbeat for device {} (healthy: {:?}, free_memory: {:?})",
            device_id, self.healthy, self.free_memory
        );
        diesel::update(devices::table.filter(devices::device_id.eq(device_id)))
            .set(self)
            .execute(conn)
    }
}
