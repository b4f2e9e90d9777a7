//! Particulate matter sampling.
//!
//! The sensor fan draws most of the measurement energy, so the sensor sleeps
//! between the hourly measurements. A manual fan cleaning runs with the
//! first measurement and then every [`FAN_CLEANING_PERIOD`] measurements.

use log::{debug, error, info, warn};

use super::{ParticulateData, ParticulateSensor, SensorError};
use crate::config::timing::FAN_CLEANING_PERIOD;
use crate::storage::{PARTICULATE_COUNTER_TAG, PersistentStorage, StorageError};

pub struct ParticulateProvider<S> {
    sensor: S,
    ready: bool,
    measurement_counter: u32,
}

impl<S: ParticulateSensor> ParticulateProvider<S> {
    pub fn new(sensor: S) -> Self {
        Self {
            sensor,
            ready: false,
            measurement_counter: 0,
        }
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    /// Cold boot probes and identifies the sensor. A warm wake trusts the
    /// sensor is still there and only restores the cleaning counter.
    pub async fn setup<P: PersistentStorage>(
        &mut self,
        woken: bool,
        storage: &P,
    ) -> Result<(), SensorError> {
        self.measurement_counter = storage.get_or_default(PARTICULATE_COUNTER_TAG);
        if woken {
            self.ready = true;
            return Ok(());
        }

        self.ready = false;
        self.sensor.probe().await.map_err(|e| {
            error!(" Particulate sensor probe failed: {}", e);
            e
        })?;
        match self.sensor.serial_number().await {
            Ok(serial) => info!(" Particulate sensor serial {}", serial),
            Err(e) => warn!(" {}", e),
        }
        self.sensor.reset().await?;
        match self.sensor.version().await {
            Ok((major, minor)) => info!(" Particulate sensor firmware {}.{}", major, minor),
            Err(e) => warn!(" {}", e),
        }
        match self.sensor.auto_cleaning_interval().await {
            Ok(secs) => info!(" Particulate auto-cleaning interval {} s", secs),
            Err(e) => warn!(" {}", e),
        }
        self.ready = true;
        Ok(())
    }

    pub async fn wake_up(&mut self) -> Result<(), SensorError> {
        self.check_ready()?;
        self.sensor.wake_up().await
    }

    pub async fn start_measure(&mut self) -> Result<(), SensorError> {
        self.check_ready()?;
        let clean = self.measurement_counter % FAN_CLEANING_PERIOD == 0;
        if clean {
            debug!(" Fan cleaning with measurement {}", self.measurement_counter + 1);
        }
        self.sensor.start_measurement(clean).await?;
        self.measurement_counter = self.measurement_counter.wrapping_add(1);
        Ok(())
    }

    pub async fn read_measurement(&mut self) -> Result<ParticulateData, SensorError> {
        self.check_ready()?;
        let data = self.sensor.read_measurement().await?;
        debug!(
            " PM1.0={} PM2.5={} PM10={}",
            data.pm1_0, data.pm2_5, data.pm10
        );
        Ok(data)
    }

    /// Stop measuring and put the sensor to sleep.
    pub async fn hibernate(&mut self) -> Result<(), SensorError> {
        self.check_ready()?;
        self.sensor.stop_measurement().await?;
        self.sensor.sleep().await
    }

    pub fn save<P: PersistentStorage>(&self, storage: &mut P) -> Result<(), StorageError> {
        storage.set(PARTICULATE_COUNTER_TAG, &self.measurement_counter)
    }

    fn check_ready(&self) -> Result<(), SensorError> {
        if self.ready {
            Ok(())
        } else {
            Err(SensorError::NotReady {
                sensor: "particulate",
            })
        }
    }
}
