//! Python bindings for the DAVIS stream translator with numpy support.
//!
//! Recorded transfers are decoded offline and returned in columnar form, one
//! numpy array per field, ready for numpy or pandas.

use davis_core::packet::EventPacketContainer;
use davis_core::{ChipVariant, DeviceInfo, OfflineDecoder, SessionConfig};
use numpy::{IntoPyArray, PyArray1};
use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::path::PathBuf;

/// Polarity events in columnar form.
#[pyclass]
pub struct Events {
    x: Vec<u16>,
    y: Vec<u16>,
    /// 0 = OFF, 1 = ON
    polarity: Vec<u8>,
    /// Full 64-bit timestamps in microseconds
    timestamp: Vec<i64>,
    sensor_width: u32,
    sensor_height: u32,
}

#[pymethods]
impl Events {
    fn __len__(&self) -> usize {
        self.x.len()
    }

    fn __repr__(&self) -> String {
        format!(
            "Events(count={}, sensor={}x{})",
            self.x.len(),
            self.sensor_width,
            self.sensor_height
        )
    }

    #[getter]
    fn x<'py>(&self, py: Python<'py>) -> &'py PyArray1<u16> {
        self.x.clone().into_pyarray(py)
    }

    #[getter]
    fn y<'py>(&self, py: Python<'py>) -> &'py PyArray1<u16> {
        self.y.clone().into_pyarray(py)
    }

    #[getter]
    fn polarity<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.polarity.clone().into_pyarray(py)
    }

    /// Alias for polarity.
    #[getter]
    fn p<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.polarity.clone().into_pyarray(py)
    }

    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<i64> {
        self.timestamp.clone().into_pyarray(py)
    }

    /// Alias for timestamp.
    #[getter]
    fn t<'py>(&self, py: Python<'py>) -> &'py PyArray1<i64> {
        self.timestamp.clone().into_pyarray(py)
    }

    #[getter]
    fn sensor_size(&self) -> (u32, u32) {
        (self.sensor_width, self.sensor_height)
    }

    /// All columns as a dictionary, e.g. for `pandas.DataFrame`.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<PyObject> {
        let dict = PyDict::new(py);
        dict.set_item("x", self.x.clone().into_pyarray(py))?;
        dict.set_item("y", self.y.clone().into_pyarray(py))?;
        dict.set_item("polarity", self.polarity.clone().into_pyarray(py))?;
        dict.set_item("timestamp", self.timestamp.clone().into_pyarray(py))?;
        Ok(dict.into())
    }
}

/// IMU6 samples in columnar form. Acceleration in g, angular velocity in
/// degrees per second, temperature in degrees Celsius.
#[pyclass]
pub struct ImuSamples {
    timestamp: Vec<i64>,
    accel: [Vec<f32>; 3],
    gyro: [Vec<f32>; 3],
    temperature: Vec<f32>,
}

#[pymethods]
impl ImuSamples {
    fn __len__(&self) -> usize {
        self.timestamp.len()
    }

    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<i64> {
        self.timestamp.clone().into_pyarray(py)
    }

    #[getter]
    fn accel_x<'py>(&self, py: Python<'py>) -> &'py PyArray1<f32> {
        self.accel[0].clone().into_pyarray(py)
    }

    #[getter]
    fn accel_y<'py>(&self, py: Python<'py>) -> &'py PyArray1<f32> {
        self.accel[1].clone().into_pyarray(py)
    }

    #[getter]
    fn accel_z<'py>(&self, py: Python<'py>) -> &'py PyArray1<f32> {
        self.accel[2].clone().into_pyarray(py)
    }

    #[getter]
    fn gyro_x<'py>(&self, py: Python<'py>) -> &'py PyArray1<f32> {
        self.gyro[0].clone().into_pyarray(py)
    }

    #[getter]
    fn gyro_y<'py>(&self, py: Python<'py>) -> &'py PyArray1<f32> {
        self.gyro[1].clone().into_pyarray(py)
    }

    #[getter]
    fn gyro_z<'py>(&self, py: Python<'py>) -> &'py PyArray1<f32> {
        self.gyro[2].clone().into_pyarray(py)
    }

    #[getter]
    fn temperature<'py>(&self, py: Python<'py>) -> &'py PyArray1<f32> {
        self.temperature.clone().into_pyarray(py)
    }
}

/// Special events: timestamps, type codes and names.
#[pyclass]
pub struct SpecialEvents {
    timestamp: Vec<i64>,
    kind: Vec<u8>,
    names: Vec<&'static str>,
}

#[pymethods]
impl SpecialEvents {
    fn __len__(&self) -> usize {
        self.timestamp.len()
    }

    #[getter]
    fn timestamp<'py>(&self, py: Python<'py>) -> &'py PyArray1<i64> {
        self.timestamp.clone().into_pyarray(py)
    }

    /// Numeric event type codes.
    #[getter]
    fn kind<'py>(&self, py: Python<'py>) -> &'py PyArray1<u8> {
        self.kind.clone().into_pyarray(py)
    }

    /// Event type names, e.g. "APS_FRAME_START".
    #[getter]
    fn names(&self) -> Vec<&'static str> {
        self.names.clone()
    }
}

/// Everything decoded from one recording.
#[pyclass]
pub struct DecodeResult {
    #[pyo3(get)]
    events: Py<Events>,
    #[pyo3(get)]
    imu: Py<ImuSamples>,
    #[pyo3(get)]
    specials: Py<SpecialEvents>,
}

fn collect(containers: &[EventPacketContainer], info: &DeviceInfo) -> (Events, ImuSamples, SpecialEvents) {
    let (width, height) = info.dvs_output_size();
    let mut events = Events {
        x: Vec::new(),
        y: Vec::new(),
        polarity: Vec::new(),
        timestamp: Vec::new(),
        sensor_width: width as u32,
        sensor_height: height as u32,
    };
    let mut imu = ImuSamples {
        timestamp: Vec::new(),
        accel: Default::default(),
        gyro: Default::default(),
        temperature: Vec::new(),
    };
    let mut specials = SpecialEvents {
        timestamp: Vec::new(),
        kind: Vec::new(),
        names: Vec::new(),
    };

    for container in containers {
        if let Some(packet) = &container.polarity {
            for event in packet {
                events.x.push(event.x);
                events.y.push(event.y);
                events.polarity.push(event.polarity as u8);
                events.timestamp.push(packet.full_timestamp(event));
            }
        }

        if let Some(packet) = &container.imu6 {
            for sample in packet {
                imu.timestamp.push(packet.full_timestamp(sample));
                imu.accel[0].push(sample.accel_x);
                imu.accel[1].push(sample.accel_y);
                imu.accel[2].push(sample.accel_z);
                imu.gyro[0].push(sample.gyro_x);
                imu.gyro[1].push(sample.gyro_y);
                imu.gyro[2].push(sample.gyro_z);
                imu.temperature.push(sample.temperature);
            }
        }

        if let Some(packet) = &container.special {
            for event in packet {
                specials.timestamp.push(packet.full_timestamp(event));
                specials.kind.push(event.kind as u8);
                specials.names.push(event.kind.name());
            }
        }
    }

    (events, imu, specials)
}

fn decoder_for(chip: &str) -> PyResult<(OfflineDecoder, DeviceInfo)> {
    let chip: ChipVariant = chip
        .parse()
        .map_err(|e| PyValueError::new_err(format!("{}", e)))?;
    let info = DeviceInfo::for_chip(chip, 1);
    let decoder = OfflineDecoder::new(&info, &SessionConfig::default())
        .map_err(|e| PyValueError::new_err(format!("Failed to set up decoder: {}", e)))?;
    Ok((decoder, info))
}

fn into_result(py: Python<'_>, containers: &[EventPacketContainer], info: &DeviceInfo) -> PyResult<Py<DecodeResult>> {
    let (events, imu, specials) = collect(containers, info);
    Py::new(
        py,
        DecodeResult {
            events: Py::new(py, events)?,
            imu: Py::new(py, imu)?,
            specials: Py::new(py, specials)?,
        },
    )
}

/// Decodes a capture file of concatenated USB transfer payloads.
///
/// Args:
///     path: Path to the capture file
///     chip: Sensor name, e.g. "DAVIS346" or "DVXPLORER"
///
/// Returns:
///     DecodeResult: with `events`, `imu` and `specials`
///
/// Example:
///     >>> import davis
///     >>> result = davis.decode_file("capture.bin", chip="DAVIS240C")
///     >>> print(f"Decoded {len(result.events)} events")
#[pyfunction]
#[pyo3(signature = (path, chip="DAVIS346"))]
fn decode_file(py: Python<'_>, path: &str, chip: &str) -> PyResult<Py<DecodeResult>> {
    let (mut decoder, info) = decoder_for(chip)?;
    let containers = decoder
        .decode_file(PathBuf::from(path))
        .map_err(|e| PyIOError::new_err(format!("Failed to decode file: {}", e)))?;
    into_result(py, &containers, &info)
}

/// Decodes raw transfer bytes already in memory.
#[pyfunction]
#[pyo3(signature = (data, chip="DAVIS346"))]
fn decode_bytes(py: Python<'_>, data: &[u8], chip: &str) -> PyResult<Py<DecodeResult>> {
    let (mut decoder, info) = decoder_for(chip)?;
    let mut containers = Vec::new();
    decoder.decode_buffer(data, &mut containers);
    decoder.finish(&mut containers);
    into_result(py, &containers, &info)
}

/// DAVIS event stream translator for Python.
#[pymodule]
fn davis(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(decode_file, m)?)?;
    m.add_function(wrap_pyfunction!(decode_bytes, m)?)?;
    m.add_class::<Events>()?;
    m.add_class::<ImuSamples>()?;
    m.add_class::<SpecialEvents>()?;
    m.add_class::<DecodeResult>()?;
    Ok(())
}
