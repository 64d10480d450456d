//! NumPy `.npz` weight archives.
//!
//! Weights are stored the way Keras `get_weights()` returns them: a flat,
//! ordered list of arrays saved positionally as `arr_0.npy .. arr_{n-1}.npy`.
//! Binding is therefore purely positional and every array's shape is checked
//! against what the layer expects.

use candle_core::{Device, Tensor};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{InferenceError, InferenceResult};

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Where a layer's weights came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightSource {
    /// Weights trained for this task
    Custom,
    /// Generic pretrained weights
    Pretrained,
    /// Randomly initialized, no artifact could be used
    RandomInit,
}

impl WeightSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightSource::Custom => "custom",
            WeightSource::Pretrained => "pretrained",
            WeightSource::RandomInit => "random_init",
        }
    }
}

impl fmt::Display for WeightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which artifact a loaded layer is running on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerProvenance {
    pub layer: String,
    pub source: WeightSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl LayerProvenance {
    pub fn new(layer: impl Into<String>, source: WeightSource, path: Option<PathBuf>) -> Self {
        Self {
            layer: layer.into(),
            source,
            path,
        }
    }

    /// True if the layer is not running on weights trained for this task.
    pub fn is_degraded(&self) -> bool {
        self.source != WeightSource::Custom
    }
}

/// All arrays of one archive, in positional order.
#[derive(Debug)]
pub struct WeightArchive {
    path: PathBuf,
    arrays: Vec<Tensor>,
}

impl WeightArchive {
    /// Read an archive from disk.
    pub fn open(path: impl AsRef<Path>, device: &Device) -> InferenceResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(InferenceError::WeightsUnavailable(format!(
                "{} not found",
                path.display()
            )));
        }
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), path, device)
    }

    /// Read an archive from any seekable reader. `path` is used for messages only.
    pub fn from_reader<R: Read + Seek>(
        reader: R,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> InferenceResult<Self> {
        let path = path.as_ref();
        let mut zip = ZipArchive::new(reader)
            .map_err(|e| InferenceError::incompatible(path, format!("not a zip archive: {}", e)))?;

        let mut positions = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let name = zip
                .by_index(i)
                .map_err(|e| InferenceError::incompatible(path, e.to_string()))?
                .name()
                .to_string();
            let position = array_position(&name).ok_or_else(|| {
                InferenceError::incompatible(path, format!("unexpected entry {}", name))
            })?;
            positions.push((position, i));
        }
        positions.sort_unstable();

        let mut arrays = Vec::with_capacity(positions.len());
        for (expected, (position, index)) in positions.into_iter().enumerate() {
            if position != expected {
                return Err(InferenceError::incompatible(
                    path,
                    format!("missing array arr_{}", expected),
                ));
            }
            let mut entry = zip
                .by_index(index)
                .map_err(|e| InferenceError::incompatible(path, e.to_string()))?;
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            let array = parse_npy(&bytes)
                .map_err(|msg| InferenceError::incompatible(path, format!("arr_{}: {}", position, msg)))?;
            arrays.push(Tensor::from_vec(array.data, array.shape, device)?);
        }

        Ok(Self {
            path: path.to_path_buf(),
            arrays,
        })
    }

    /// Write tensors as a compressed archive readable by `numpy.load`.
    pub fn save(path: impl AsRef<Path>, tensors: &[Tensor]) -> InferenceResult<()> {
        let path = path.as_ref();
        let file = File::create(path)?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for (i, tensor) in tensors.iter().enumerate() {
            let data = tensor.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?;
            let bytes = encode_npy(tensor.dims(), &data);
            zip.start_file(format!("arr_{}.npy", i), options)
                .map_err(|e| InferenceError::internal(e.to_string()))?;
            zip.write_all(&bytes)?;
        }

        let mut writer = zip.finish().map_err(|e| InferenceError::internal(e.to_string()))?;
        writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Shapes of all arrays, in order.
    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.arrays.iter().map(|t| t.dims().to_vec()).collect()
    }

    /// Check the archive holds exactly the expected shapes.
    pub fn check_shapes(&self, expected: &[Vec<usize>]) -> InferenceResult<()> {
        if self.arrays.len() != expected.len() {
            return Err(InferenceError::incompatible(
                &self.path,
                format!("expected {} arrays, found {}", expected.len(), self.arrays.len()),
            ));
        }
        for (i, (tensor, shape)) in self.arrays.iter().zip(expected).enumerate() {
            if tensor.dims() != shape.as_slice() {
                return Err(InferenceError::incompatible(
                    &self.path,
                    format!("arr_{} has shape {:?}, expected {:?}", i, tensor.dims(), shape),
                ));
            }
        }
        Ok(())
    }

    /// Consume the archive as a positional cursor.
    pub fn into_cursor(self) -> WeightCursor {
        WeightCursor {
            path: self.path,
            arrays: self.arrays.into_iter(),
            position: 0,
        }
    }
}

/// Hands out arrays in order, validating each shape.
pub struct WeightCursor {
    path: PathBuf,
    arrays: std::vec::IntoIter<Tensor>,
    position: usize,
}

impl WeightCursor {
    /// Take the next array, which must have exactly `shape`.
    pub fn take(&mut self, shape: &[usize]) -> InferenceResult<Tensor> {
        let tensor = self.arrays.next().ok_or_else(|| {
            InferenceError::incompatible(
                &self.path,
                format!("archive ended at arr_{}, expected shape {:?}", self.position, shape),
            )
        })?;
        if tensor.dims() != shape {
            return Err(InferenceError::incompatible(
                &self.path,
                format!(
                    "arr_{} has shape {:?}, expected {:?}",
                    self.position,
                    tensor.dims(),
                    shape
                ),
            ));
        }
        self.position += 1;
        Ok(tensor)
    }

    /// Fail if arrays are left over.
    pub fn finish(self) -> InferenceResult<()> {
        let remaining = self.arrays.len();
        if remaining > 0 {
            return Err(InferenceError::incompatible(
                &self.path,
                format!("{} unused arrays after the first {}", remaining, self.position),
            ));
        }
        Ok(())
    }
}

/// Position of an `arr_N.npy` entry.
fn array_position(name: &str) -> Option<usize> {
    name.strip_prefix("arr_")?.strip_suffix(".npy")?.parse().ok()
}

#[derive(Debug)]
struct NpyArray {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Parse a little-endian float `.npy` file.
fn parse_npy(bytes: &[u8]) -> Result<NpyArray, String> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err("not an npy file".to_string());
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err("truncated header".to_string());
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        v => return Err(format!("unsupported npy version {}", v)),
    };
    let data_start = header_start + header_len;
    let header = bytes
        .get(header_start..data_start)
        .and_then(|h| std::str::from_utf8(h).ok())
        .ok_or_else(|| "truncated header".to_string())?;

    let descr = header_value(header, "descr").ok_or("missing descr")?;
    let fortran = header_value(header, "fortran_order").ok_or("missing fortran_order")?;
    let shape_str = header_value(header, "shape").ok_or("missing shape")?;

    if fortran != "False" {
        return Err("fortran-ordered arrays are not supported".to_string());
    }

    let shape = shape_str
        .trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| format!("bad shape {}", shape_str)))
        .collect::<Result<Vec<_>, _>>()?;
    let count: usize = shape.iter().product();

    let payload = &bytes[data_start..];
    let data: Vec<f32> = match descr {
        "<f4" => {
            check_payload(payload.len(), count, 4)?;
            payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        }
        "<f8" => {
            check_payload(payload.len(), count, 8)?;
            payload
                .chunks_exact(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    f64::from_le_bytes(b) as f32
                })
                .collect()
        }
        other => return Err(format!("unsupported dtype {}", other)),
    };

    Ok(NpyArray { shape, data })
}

fn check_payload(len: usize, count: usize, item: usize) -> Result<(), String> {
    if len != count * item {
        return Err(format!(
            "payload is {} bytes, expected {} elements of {} bytes",
            len, count, item
        ));
    }
    Ok(())
}

/// Value of `key` in a python dict literal header.
fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{}':", key);
    let rest = header[header.find(&pattern)? + pattern.len()..].trim_start();
    if let Some(quoted) = rest.strip_prefix('\'') {
        return quoted.split('\'').next();
    }
    if rest.starts_with('(') {
        let end = rest.find(')')?;
        return Some(&rest[..=end]);
    }
    let end = rest.find([',', '}'])?;
    Some(rest[..end].trim())
}

/// Encode an `.npy` version 1.0 file with little-endian f32 data.
fn encode_npy(shape: &[usize], data: &[f32]) -> Vec<u8> {
    let shape_str = match shape {
        [] => "()".to_string(),
        [d] => format!("({},)", d),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': {}, }}",
        shape_str
    );
    // Magic, version and length take 10 bytes; total header is padded to 64
    let unpadded = 10 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut out = Vec::with_capacity(10 + header.len() + data.len() * 4);
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(shape: &[usize], start: f32) -> Tensor {
        let count: usize = shape.iter().product();
        let data: Vec<f32> = (0..count).map(|i| start + i as f32).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_header_value() {
        let header = "{'descr': '<f4', 'fortran_order': False, 'shape': (3, 3, 32), }";
        assert_eq!(header_value(header, "descr"), Some("<f4"));
        assert_eq!(header_value(header, "fortran_order"), Some("False"));
        assert_eq!(header_value(header, "shape"), Some("(3, 3, 32)"));
        assert_eq!(header_value(header, "missing"), None);
    }

    #[test]
    fn test_npy_header_is_aligned() {
        let bytes = encode_npy(&[2, 3], &[0.0; 6]);
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');

        let parsed = parse_npy(&bytes).unwrap();
        assert_eq!(parsed.shape, vec![2, 3]);
        assert_eq!(parsed.data.len(), 6);
    }

    #[test]
    fn test_parse_npy_f8_and_vector_shape() {
        let mut header = "{'descr': '<f8', 'fortran_order': False, 'shape': (2,), }".to_string();
        let unpadded = 10 + header.len() + 1;
        header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
        header.push('\n');
        let mut bytes = NPY_MAGIC.to_vec();
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&1.5f64.to_le_bytes());
        bytes.extend_from_slice(&(-2.0f64).to_le_bytes());

        let parsed = parse_npy(&bytes).unwrap();
        assert_eq!(parsed.shape, vec![2]);
        assert_eq!(parsed.data, vec![1.5, -2.0]);
    }

    #[test]
    fn test_parse_npy_rejects_bad_input() {
        assert!(parse_npy(b"not numpy at all").is_err());

        let mut bytes = encode_npy(&[4], &[1.0, 2.0, 3.0, 4.0]);
        bytes.truncate(bytes.len() - 4);
        assert!(parse_npy(&bytes).unwrap_err().contains("payload"));
    }

    #[test]
    fn test_save_and_open_preserves_order_and_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.npz");
        let tensors: Vec<Tensor> = (0..12).map(|i| tensor(&[2, i % 3 + 1], i as f32)).collect();
        WeightArchive::save(&path, &tensors).unwrap();

        let archive = WeightArchive::open(&path, &Device::Cpu).unwrap();
        assert_eq!(archive.len(), 12);
        assert_eq!(archive.shapes()[10], vec![2, 2]);

        // arr_10 must not sort before arr_2
        let values = archive.arrays[10].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values[0], 10.0);
    }

    #[test]
    fn test_cursor_validates_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gru.npz");
        WeightArchive::save(&path, &[tensor(&[4, 6], 0.0), tensor(&[2, 6], 0.0)]).unwrap();

        let mut cursor = WeightArchive::open(&path, &Device::Cpu).unwrap().into_cursor();
        tokio_test::assert_ok!(cursor.take(&[4, 6]));
        let err = cursor.take(&[6]).unwrap_err();
        assert!(matches!(err, InferenceError::IncompatibleWeights { .. }));
        assert!(err.to_string().contains("arr_1"));
    }

    #[test]
    fn test_cursor_rejects_leftover_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dense.npz");
        WeightArchive::save(&path, &[tensor(&[3, 1], 0.0), tensor(&[1], 0.0)]).unwrap();

        let mut cursor = WeightArchive::open(&path, &Device::Cpu).unwrap().into_cursor();
        cursor.take(&[3, 1]).unwrap();
        tokio_test::assert_err!(cursor.finish());
    }

    #[test]
    fn test_check_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.npz");
        WeightArchive::save(&path, &[tensor(&[3, 1], 0.0), tensor(&[1], 0.0)]).unwrap();
        let archive = WeightArchive::open(&path, &Device::Cpu).unwrap();

        tokio_test::assert_ok!(archive.check_shapes(&[vec![3, 1], vec![1]]));
        tokio_test::assert_err!(archive.check_shapes(&[vec![3, 1]]));
        tokio_test::assert_err!(archive.check_shapes(&[vec![1, 3], vec![1]]));
    }

    #[test]
    fn test_open_deflated_numpy_archive() {
        // Written the way numpy.savez_compressed writes: deflate with zip64 local headers
        let bytes = include_bytes!("../testdata/numpy_compressed.npz");
        let archive =
            WeightArchive::from_reader(std::io::Cursor::new(&bytes[..]), "compressed.npz", &Device::Cpu)
                .unwrap();

        assert_eq!(archive.shapes(), vec![vec![2, 3], vec![3], vec![1]]);
        let first = archive.arrays[0].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(first, vec![0.5, -1.25, 2.0, 3.0, 4.0, 0.001]);
        let second = archive.arrays[1].to_vec1::<f32>().unwrap();
        assert_eq!(second, vec![1.5, -2.0, 0.25]);
        tokio_test::assert_ok!(archive.check_shapes(&[vec![2, 3], vec![3], vec![1]]));
    }

    #[test]
    fn test_open_missing_file() {
        let err = WeightArchive::open("/nonexistent/weights.npz", &Device::Cpu).unwrap_err();
        assert!(matches!(err, InferenceError::WeightsUnavailable(_)));
    }

    #[test]
    fn test_open_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.npz");
        std::fs::write(&path, b"definitely not a zip").unwrap();
        let err = WeightArchive::open(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(err, InferenceError::IncompatibleWeights { .. }));
    }
}
