//! Arrays as FITS HDUs, plus the manifest that describes them.
//!
//! Every array is its own HDU named after the dataset. Complex values are stored as float32
//! with a trailing axis of length 2, booleans as uint8, strings as a one column binary table.
//! The `MANIFEST` table holds one JSON document per row: the file header first, then one entry
//! per dataset in the order they were written.

use std::path::Path;

use fitsio::{
    errors::{Error as FitsError, FitsError as FitsStatusError},
    images::{ImageDescription, ImageType},
    tables::{ColumnDataType, ColumnDescription},
    FitsFile,
};
use indexmap::IndexMap;
use log::trace;
use ndarray::{ArrayD, IxDyn};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use super::error::IOError;
use crate::{
    axes::{Axis, ContainerKind, Role},
    dataset::{Attrs, DType, DataArray},
};

/// The name of the HDU holding the manifest.
pub const MANIFEST_HDU: &str = "MANIFEST";
const MANIFEST_COL: &str = "ENTRY";
const STRING_COL: &str = "VALUE";
/// The cfitsio status for a missing HDU.
const BAD_HDU_NUM: i32 = 301;

macro_rules! fits_io {
    ($filename:expr, $hdu:expr, $result:expr) => {
        $result.map_err(|fits_error| IOError::FitsIO {
            fits_error,
            fits_filename: $filename.to_string(),
            hdu_name: $hdu.to_string(),
            source_file: file!(),
            source_line: line!(),
        })
    };
}

/// What a file holds as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHeader {
    /// The container kind, absent for a plain group of arrays
    pub kind: Option<ContainerKind>,
    /// The axis the container was distributed along when written
    pub dist_axis: Option<Axis>,
    /// Container attributes
    pub attrs: Attrs,
}

/// One dataset in a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    /// The dataset and HDU name
    pub name: String,
    /// The element type
    pub dtype: DType,
    /// The shape stored in this file
    pub shape: Vec<usize>,
    /// The dataset's role in the container
    pub role: Role,
    /// Whether the dataset was distributed when written
    pub distributed: bool,
    /// Dataset attributes
    pub attrs: Attrs,
}

/// The contents of a `MANIFEST` HDU.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// The file header
    pub header: FileHeader,
    /// Every dataset, in HDU order
    pub datasets: Vec<DatasetEntry>,
}

impl Manifest {
    /// The entry for `name`, if any.
    pub fn entry(&self, name: &str) -> Option<&DatasetEntry> {
        self.datasets.iter().find(|entry| entry.name == name)
    }
}

/// Writes arrays to a new FITS file.
pub struct FitsWriter {
    fptr: FitsFile,
    filename: String,
}

impl FitsWriter {
    /// Create a file at `path`, replacing any that exists.
    ///
    /// # Errors
    ///
    /// [`IOError::StdIo`] if an existing file can't be removed, [`IOError::FitsOpen`] if the
    /// file can't be created.
    pub fn create(path: &Path) -> Result<Self, IOError> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let filename = path.display().to_string();
        let fptr = FitsFile::create(path)
            .open()
            .map_err(|fits_error| IOError::FitsOpen {
                fits_error,
                fits_filename: filename.clone(),
                source_file: file!(),
                source_line: line!(),
            })?;
        trace!("created {}", filename);
        Ok(Self { fptr, filename })
    }

    /// Write `data` to a new HDU called `name`.
    ///
    /// # Errors
    ///
    /// [`IOError::FitsIO`] for any cfitsio failure.
    pub fn write_array(&mut self, name: &str, data: &DataArray) -> Result<(), IOError> {
        let mut dims = data.shape().to_vec();
        if dims.is_empty() {
            dims.push(1);
        }
        trace!("writing {} {:?} to {}", name, data.shape(), self.filename);

        macro_rules! write_image {
            ($image_type:expr, $dims:expr, $flat:expr) => {{
                let description = ImageDescription {
                    data_type: $image_type,
                    dimensions: &$dims[..],
                };
                let hdu = fits_io!(
                    self.filename,
                    name,
                    self.fptr.create_image(name.to_string(), &description)
                )?;
                let flat = $flat;
                if !flat.is_empty() {
                    fits_io!(self.filename, name, hdu.write_image(&mut self.fptr, &flat))?;
                }
                Ok(())
            }};
        }

        match data {
            DataArray::Complex(array) => {
                dims.push(2);
                write_image!(
                    ImageType::Float,
                    dims,
                    array.iter().flat_map(|v| [v.re, v.im]).collect::<Vec<f32>>()
                )
            }
            DataArray::Bool(array) => write_image!(
                ImageType::UnsignedByte,
                dims,
                array.iter().map(|&v| u8::from(v)).collect::<Vec<u8>>()
            ),
            DataArray::Float(array) => write_image!(
                ImageType::Double,
                dims,
                array.iter().copied().collect::<Vec<f64>>()
            ),
            DataArray::Int(array) => write_image!(
                ImageType::LongLong,
                dims,
                array.iter().copied().collect::<Vec<i64>>()
            ),
            DataArray::Str(array) => {
                let values = array.iter().cloned().collect::<Vec<String>>();
                self.write_strings(name, STRING_COL, &values)
            }
        }
    }

    fn write_strings(&mut self, name: &str, column: &str, values: &[String]) -> Result<(), IOError> {
        let width = values.iter().map(String::len).max().unwrap_or_default().max(1);
        let description = fits_io!(
            self.filename,
            name,
            ColumnDescription::new(column)
                .with_type(ColumnDataType::String)
                .that_repeats(width)
                .create()
        )?;
        let hdu = fits_io!(
            self.filename,
            name,
            self.fptr.create_table(name.to_string(), &[description])
        )?;
        if !values.is_empty() {
            fits_io!(self.filename, name, hdu.write_col(&mut self.fptr, column, values))?;
        }
        Ok(())
    }

    /// Write the manifest HDU.
    ///
    /// # Errors
    ///
    /// [`IOError::Manifest`] if serialisation fails, [`IOError::FitsIO`] for cfitsio failures.
    pub fn write_manifest(&mut self, manifest: &Manifest) -> Result<(), IOError> {
        let to_json = |result: Result<String, serde_json::Error>| {
            result.map_err(|source| IOError::Manifest {
                fits_filename: self.filename.clone(),
                source,
            })
        };
        let mut rows = vec![to_json(serde_json::to_string(&manifest.header))?];
        for entry in &manifest.datasets {
            rows.push(to_json(serde_json::to_string(entry))?);
        }
        self.write_strings(MANIFEST_HDU, MANIFEST_COL, &rows)
    }
}

/// Reads arrays from a FITS file written by [`FitsWriter`].
pub struct FitsReader {
    fptr: FitsFile,
    filename: String,
}

impl FitsReader {
    /// Open an existing file.
    ///
    /// # Errors
    ///
    /// [`IOError::FitsOpen`] if the file can't be opened.
    pub fn open(path: &Path) -> Result<Self, IOError> {
        let filename = path.display().to_string();
        let fptr = FitsFile::open(path).map_err(|fits_error| IOError::FitsOpen {
            fits_error,
            fits_filename: filename.clone(),
            source_file: file!(),
            source_line: line!(),
        })?;
        Ok(Self { fptr, filename })
    }

    /// The file name, for messages.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    fn hdu(&mut self, name: &str) -> Result<fitsio::hdu::FitsHdu, IOError> {
        match self.fptr.hdu(name) {
            Ok(hdu) => Ok(hdu),
            Err(FitsError::Fits(FitsStatusError {
                status: BAD_HDU_NUM,
                ..
            })) => Err(IOError::MissingHdu {
                fits_filename: self.filename.clone(),
                hdu_name: name.into(),
            }),
            Err(e) => fits_io!(self.filename, name, Err(e)),
        }
    }

    fn read_strings(&mut self, name: &str, column: &str, len: usize) -> Result<Vec<String>, IOError> {
        let hdu = self.hdu(name)?;
        if len == 0 {
            return Ok(vec![]);
        }
        fits_io!(self.filename, name, hdu.read_col::<String>(&mut self.fptr, column))
    }

    /// Read the manifest.
    ///
    /// # Errors
    ///
    /// [`IOError::MissingHdu`] if there is none, [`IOError::Manifest`] if it can't be parsed.
    pub fn read_manifest(&mut self) -> Result<Manifest, IOError> {
        let hdu = self.hdu(MANIFEST_HDU)?;
        let rows: Vec<String> = fits_io!(
            self.filename,
            MANIFEST_HDU,
            hdu.read_col(&mut self.fptr, MANIFEST_COL)
        )?;
        let parse_error = |source| IOError::Manifest {
            fits_filename: self.filename.clone(),
            source,
        };
        let mut rows = rows.iter();
        let header = match rows.next() {
            Some(row) => serde_json::from_str(row).map_err(parse_error)?,
            None => {
                return Err(IOError::MissingHdu {
                    fits_filename: self.filename.clone(),
                    hdu_name: format!("{MANIFEST_HDU} header"),
                })
            }
        };
        let datasets = rows
            .map(|row| serde_json::from_str(row).map_err(parse_error))
            .collect::<Result<_, _>>()?;
        Ok(Manifest { header, datasets })
    }

    /// Read the dataset described by `entry`.
    ///
    /// # Errors
    ///
    /// [`IOError::MissingHdu`], [`IOError::InconsistentFiles`] if the HDU doesn't hold the
    /// shape the manifest claims, or cfitsio failures.
    pub fn read_array(&mut self, entry: &DatasetEntry) -> Result<DataArray, IOError> {
        let name = entry.name.as_str();
        let len: usize = entry.shape.iter().product();
        trace!("reading {} {:?} from {}", name, entry.shape, self.filename);

        macro_rules! read_image {
            ($elem:ty) => {{
                let hdu = self.hdu(name)?;
                if len == 0 {
                    Vec::new()
                } else {
                    fits_io!(self.filename, name, hdu.read_image::<Vec<$elem>>(&mut self.fptr))?
                }
            }};
        }

        let data = match entry.dtype {
            DType::Complex64 => {
                let flat = read_image!(f32);
                let values = flat
                    .chunks_exact(2)
                    .map(|pair| Complex::new(pair[0], pair[1]))
                    .collect();
                DataArray::Complex(self.shaped(entry, values)?)
            }
            DType::Bool => {
                let flat = read_image!(u8);
                DataArray::Bool(self.shaped(entry, flat.into_iter().map(|v| v != 0).collect())?)
            }
            DType::Float64 => {
                let values = read_image!(f64);
                DataArray::Float(self.shaped(entry, values)?)
            }
            DType::Int64 => {
                let values = read_image!(i64);
                DataArray::Int(self.shaped(entry, values)?)
            }
            DType::Str => {
                let values = self.read_strings(name, STRING_COL, len)?;
                DataArray::Str(self.shaped(entry, values)?)
            }
        };
        Ok(data)
    }

    fn shaped<T>(&self, entry: &DatasetEntry, values: Vec<T>) -> Result<ArrayD<T>, IOError> {
        let found = values.len();
        ArrayD::from_shape_vec(IxDyn(&entry.shape), values).map_err(|_| {
            IOError::InconsistentFiles {
                fits_filename: self.filename.clone(),
                expected: format!("{} with shape {:?}", entry.name, entry.shape),
                found: format!("{found} values"),
            }
        })
    }
}

/// Write a plain group of arrays and attributes to one file.
///
/// # Errors
///
/// See [`FitsWriter`].
pub fn write_hdus(path: &Path, entries: &[(&str, DataArray)], attrs: &Attrs) -> Result<(), IOError> {
    let mut writer = FitsWriter::create(path)?;
    let mut datasets = Vec::with_capacity(entries.len());
    for (name, data) in entries {
        writer.write_array(name, data)?;
        datasets.push(DatasetEntry {
            name: name.to_string(),
            dtype: data.dtype(),
            shape: data.shape().to_vec(),
            role: Role::Opaque,
            distributed: false,
            attrs: Attrs::new(),
        });
    }
    writer.write_manifest(&Manifest {
        header: FileHeader {
            kind: None,
            dist_axis: None,
            attrs: attrs.clone(),
        },
        datasets,
    })
}

/// Read every array and the attributes of one file.
///
/// # Errors
///
/// See [`FitsReader`].
pub fn read_hdus(path: &Path) -> Result<(Attrs, IndexMap<String, DataArray>), IOError> {
    let mut reader = FitsReader::open(path)?;
    let manifest = reader.read_manifest()?;
    let mut arrays = IndexMap::new();
    for entry in &manifest.datasets {
        arrays.insert(entry.name.clone(), reader.read_array(entry)?);
    }
    Ok((manifest.header.attrs, arrays))
}
