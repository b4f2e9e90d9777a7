//! Temperature, humidity and pressure sampling.

use embassy_time::Timer;
use log::{debug, error, info, warn};

use super::{MeteoData, MeteoSensor, SensorError};
use crate::storage::{METEO_CALIBRATION_TAG, PersistentStorage, StorageError};

const MEASURE_POLL_MS: u64 = 2;
const MEASURE_POLL_LIMIT: u32 = 100;

pub struct MeteoProvider<S> {
    sensor: S,
    ready: bool,
    calibration_stored: bool,
    data: MeteoData,
}

impl<S: MeteoSensor> MeteoProvider<S> {
    pub fn new(sensor: S) -> Self {
        Self {
            sensor,
            ready: false,
            calibration_stored: false,
            data: MeteoData::default(),
        }
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    /// Cold boot initializes the device. A warm wake restores the stored
    /// calibration and only falls back to a full init when none is stored.
    pub async fn setup<P: PersistentStorage>(
        &mut self,
        woken: bool,
        storage: &P,
    ) -> Result<(), SensorError> {
        self.ready = false;
        if woken {
            match storage.get::<S::Calibration>(METEO_CALIBRATION_TAG) {
                Ok(Some(calibration)) => {
                    self.sensor.restore_calibration(calibration);
                    self.calibration_stored = true;
                    self.ready = true;
                    debug!(" Meteo calibration restored");
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => warn!(" {}", e),
            }
        }
        self.calibration_stored = false;
        self.sensor.init().await.map_err(|e| {
            error!(" Meteo sensor init failed: {}", e);
            e
        })?;
        info!(" Meteo sensor initialized");
        self.ready = true;
        Ok(())
    }

    /// Trigger a conversion.
    pub async fn activate(&mut self) -> Result<(), SensorError> {
        self.check_ready()?;
        self.sensor.start_measurement().await
    }

    /// Wait for the conversion to finish and latch its result.
    pub async fn measure(&mut self) -> Result<(), SensorError> {
        self.check_ready()?;
        let mut polls = 0;
        while self.sensor.is_measuring().await? {
            polls += 1;
            if polls >= MEASURE_POLL_LIMIT {
                return Err(SensorError::Timeout {
                    sensor: "meteo",
                    operation: "finish conversion",
                });
            }
            Timer::after_millis(MEASURE_POLL_MS).await;
        }
        self.data = self.sensor.measurement_data().await?;
        debug!(
            " Meteo raw: p={} t={} h={}",
            self.data.pressure_q24_8, self.data.temperature_centi, self.data.humidity_q22_10
        );
        Ok(())
    }

    pub async fn deactivate(&mut self) -> Result<(), SensorError> {
        self.check_ready()?;
        self.sensor.stop_measurement().await
    }

    /// Save calibration when it is not stored yet, then stop the device.
    pub async fn hibernate<P: PersistentStorage>(
        &mut self,
        storage: &mut P,
    ) -> Result<(), StorageError> {
        if !self.ready {
            return Ok(());
        }
        if !self.calibration_stored {
            if let Some(calibration) = self.sensor.calibration() {
                storage.set(METEO_CALIBRATION_TAG, &calibration)?;
                self.calibration_stored = true;
            }
        }
        if let Err(e) = self.sensor.stop_measurement().await {
            warn!(" Meteo stop failed: {}", e);
        }
        Ok(())
    }

    /// hPa
    pub fn pressure(&self) -> f32 {
        self.data.pressure_q24_8 as f32 / 256.0 / 100.0
    }

    /// °C
    pub fn temperature(&self) -> f32 {
        self.data.temperature_centi as f32 / 100.0
    }

    /// %RH
    pub fn humidity(&self) -> f32 {
        self.data.humidity_q22_10 as f32 / 1024.0
    }

    fn check_ready(&self) -> Result<(), SensorError> {
        if self.ready {
            Ok(())
        } else {
            Err(SensorError::NotReady { sensor: "meteo" })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RetainedStore;
    use crate::test_support::TestMeteo;
    use alloc::vec;
    use embassy_futures::block_on;

    #[test]
    fn test_cold_boot_initializes_and_stores_calibration() {
        let mut storage = RetainedStore::new(vec![0u8; 256], false);
        let mut provider = MeteoProvider::new(TestMeteo::default());
        block_on(provider.setup(false, &storage)).unwrap();
        assert_eq!(provider.sensor_mut().inits, 1);

        block_on(provider.activate()).unwrap();
        block_on(provider.measure()).unwrap();
        assert_eq!(provider.temperature(), 21.5);
        assert_eq!(provider.humidity(), 45.0);
        assert!((provider.pressure() - 1013.25).abs() < 0.01);

        block_on(provider.hibernate(&mut storage)).unwrap();
        assert_eq!(provider.sensor_mut().stops, 1);
        assert_eq!(
            storage.get::<u32>(METEO_CALIBRATION_TAG).unwrap(),
            Some(TestMeteo::CALIBRATION)
        );
    }

    #[test]
    fn test_warm_wake_restores_calibration() {
        let mut storage = RetainedStore::new(vec![0u8; 256], false);
        storage
            .set(METEO_CALIBRATION_TAG, &TestMeteo::CALIBRATION)
            .unwrap();
        let mut provider = MeteoProvider::new(TestMeteo::default());
        block_on(provider.setup(true, &storage)).unwrap();
        assert_eq!(provider.sensor_mut().inits, 0);
        assert_eq!(provider.sensor_mut().restored, Some(TestMeteo::CALIBRATION));
    }

    #[test]
    fn test_warm_wake_without_calibration_falls_back_to_init() {
        let storage = RetainedStore::new(vec![0u8; 256], false);
        let mut provider = MeteoProvider::new(TestMeteo::default());
        block_on(provider.setup(true, &storage)).unwrap();
        assert_eq!(provider.sensor_mut().inits, 1);
    }

    #[test]
    fn test_missing_sensor_is_reported() {
        let storage = RetainedStore::new(vec![0u8; 256], false);
        let mut provider = MeteoProvider::new(TestMeteo {
            absent: true,
            ..TestMeteo::default()
        });
        assert!(block_on(provider.setup(false, &storage)).is_err());
        assert_eq!(
            block_on(provider.activate()),
            Err(SensorError::NotReady { sensor: "meteo" })
        );
    }

    #[test]
    fn test_waits_for_conversion() {
        let storage = RetainedStore::new(vec![0u8; 256], false);
        let mut provider = MeteoProvider::new(TestMeteo {
            busy_polls: 3,
            ..TestMeteo::default()
        });
        block_on(provider.setup(false, &storage)).unwrap();
        block_on(provider.activate()).unwrap();
        block_on(provider.measure()).unwrap();
        assert_eq!(provider.temperature(), 21.5);
    }
}
