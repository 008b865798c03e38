// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Empty sky-image datasets: the coordinates and world-coordinate metadata of
//! an image, with no pixel data.

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::{
    attrs,
    constants::VEL_C,
    dataset::{ArrayData, AttrValue, Dataset, DatasetError, Variable},
};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("an image needs at least one {0}")]
    Empty(&'static str),

    #[error("image size must be non-zero, got {0:?}")]
    ZeroSize([usize; 2]),

    #[error("unsupported projection {0}; supported projections are: SIN")]
    UnsupportedProjection(String),

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// A spherical projection between sky coordinates and the image plane.
pub trait Projection {
    fn name(&self) -> &'static str;

    /// Sky coordinates (longitude, latitude) \[radians\] to intermediate
    /// world coordinates \[radians\].
    fn to_plane(&self, long: f64, lat: f64) -> (f64, f64);

    /// Intermediate world coordinates \[radians\] to sky coordinates
    /// (longitude, latitude) \[radians\]. [`None`] if the point isn't on the
    /// sky.
    fn to_world(&self, x: f64, y: f64) -> Option<(f64, f64)>;
}

/// Orthographic (slant-less SIN) projection about a reference point.
///
/// The plane coordinates are the direction cosines (l, m) relative to the
/// reference point, as derived in "Coordinate transformations" on page 388 of
/// Synthesis Imaging in Radio Astronomy II.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SinProjection {
    /// Reference right ascension \[radians\]
    pub ra0: f64,
    /// Reference declination \[radians\]
    pub dec0: f64,
}

impl Projection for SinProjection {
    fn name(&self) -> &'static str {
        "SIN"
    }

    fn to_plane(&self, ra: f64, dec: f64) -> (f64, f64) {
        let (s_d_ra, c_d_ra) = (ra - self.ra0).sin_cos();
        let (s_dec, c_dec) = dec.sin_cos();
        let (s_dec0, c_dec0) = self.dec0.sin_cos();
        (c_dec * s_d_ra, s_dec * c_dec0 - c_dec * s_dec0 * c_d_ra)
    }

    fn to_world(&self, l: f64, m: f64) -> Option<(f64, f64)> {
        let r2 = l * l + m * m;
        if r2.is_nan() || r2 > 1.0 {
            return None;
        }
        let n = (1.0 - r2).sqrt();
        let (s_dec0, c_dec0) = self.dec0.sin_cos();
        let dec = (m * c_dec0 + n * s_dec0).clamp(-1.0, 1.0).asin();
        let ra = self.ra0 + l.atan2(n * c_dec0 - m * s_dec0);
        Some((ra.rem_euclid(std::f64::consts::TAU), dec))
    }
}

/// Build a projection from its name.
pub fn projection_from_name(
    name: &str,
    reference: [f64; 2],
) -> Result<Box<dyn Projection>, ImageError> {
    match name.to_uppercase().as_str() {
        "SIN" => Ok(Box::new(SinProjection {
            ra0: reference[0],
            dec0: reference[1],
        })),
        _ => Err(ImageError::UnsupportedProjection(name.to_string())),
    }
}

/// What describes an empty sky image.
#[derive(Clone, Debug, PartialEq)]
pub struct SkyImageParams {
    /// (RA, Dec) of the image centre \[radians\]
    pub phase_center: [f64; 2],
    /// Pixels along (l, m)
    pub image_size: [usize; 2],
    /// Pixel size along (l, m) \[radians\]
    pub cell_size: [f64; 2],
    /// Channel frequencies \[Hz\]
    pub chan_coords: Vec<f64>,
    pub pol_coords: Vec<String>,
    /// \[MJD days\]
    pub time_coords: Vec<f64>,
    pub direction_reference: String,
    pub projection: String,
    pub spectral_reference: String,
    /// Also compute the right ascension and declination of every pixel.
    pub do_sky_coords: bool,
}

impl Default for SkyImageParams {
    fn default() -> Self {
        Self {
            phase_center: [0.0, 0.0],
            image_size: [128, 128],
            cell_size: [1e-5, 1e-5],
            chan_coords: vec![1.4e9],
            pol_coords: vec!["I".to_string()],
            time_coords: vec![0.0],
            direction_reference: "fk5".to_string(),
            projection: "SIN".to_string(),
            spectral_reference: "lsrk".to_string(),
            do_sky_coords: true,
        }
    }
}

/// Pixel offsets from the centre pixel `size / 2`, times `cdelt`.
fn plane_coords(size: usize, cdelt: f64) -> Array1<f64> {
    let centre = (size / 2) as f64;
    (0..size).map(|i| (i as f64 - centre) * cdelt).collect()
}

/// Make a dataset with the coordinates and metadata of an image, but no
/// data variables.
///
/// The rest frequency is the middle channel, and velocities use the radio
/// convention.
pub fn make_empty_sky_image(params: &SkyImageParams) -> Result<Dataset, ImageError> {
    let [nx, ny] = params.image_size;
    if nx == 0 || ny == 0 {
        return Err(ImageError::ZeroSize(params.image_size));
    }
    if params.chan_coords.is_empty() {
        return Err(ImageError::Empty("channel"));
    }
    if params.time_coords.is_empty() {
        return Err(ImageError::Empty("time"));
    }
    let cdelt = [-params.cell_size[0].abs(), params.cell_size[1].abs()];

    let freqs = Array1::from(params.chan_coords.clone());
    let rest_freq = freqs[freqs.len() / 2];
    let velocity = freqs.mapv(|f| (1.0 - f / rest_freq) * VEL_C);
    let freq_cdelt = if freqs.len() > 1 {
        freqs[1] - freqs[0]
    } else {
        1000.0
    };

    let mut xds = Dataset::new();
    xds.add_coord(
        "time",
        Variable::new(
            &["time"],
            ArrayData::from(Array1::from(params.time_coords.clone())),
        )
        .with_attrs(attrs! {"format" => "MJD", "scale" => "UTC", "units" => "d"}),
    )?;
    xds.add_coord(
        "polarization",
        Variable::new(
            &["polarization"],
            ArrayData::from(Array1::from(params.pol_coords.clone())),
        ),
    )?;
    xds.add_coord(
        "frequency",
        Variable::new(&["frequency"], ArrayData::from(freqs)).with_attrs(attrs! {
            "rest_frequency" => attrs! {"type" => "quantity", "units" => "Hz", "value" => rest_freq},
            "frame" => params.spectral_reference.to_uppercase(),
            "units" => "Hz",
            "wave_unit" => "mm",
            "crval" => rest_freq,
            "cdelt" => freq_cdelt,
            "pc" => 1.0,
        }),
    )?;
    xds.add_coord(
        "velocity",
        Variable::new(&["frequency"], ArrayData::from(velocity))
            .with_attrs(attrs! {"doppler_type" => "RADIO", "units" => "m/s"}),
    )?;
    xds.add_coord(
        "l",
        Variable::new(&["l"], ArrayData::from(plane_coords(nx, cdelt[0].abs()))).with_attrs(attrs! {
            "type" => "quantity",
            "crval" => 0.0,
            "cdelt" => cdelt[0],
            "units" => "rad",
            "note" => "l is the offset (i - nx / 2) * |cdelt| of pixel i from the centre. \
                       Right ascension decreases with i, so cdelt is negative.",
        }),
    )?;
    xds.add_coord(
        "m",
        Variable::new(&["m"], ArrayData::from(plane_coords(ny, cdelt[1]))).with_attrs(attrs! {
            "type" => "quantity",
            "crval" => 0.0,
            "cdelt" => cdelt[1],
            "units" => "rad",
            "note" => "m is the direction cosine towards increasing declination; \
                       pixel j is at (j - ny / 2) * cdelt.",
        }),
    )?;

    if params.do_sky_coords {
        let projection = projection_from_name(&params.projection, params.phase_center)?;
        let x = plane_coords(nx, cdelt[0]);
        let y = plane_coords(ny, cdelt[1]);
        let mut ra = Array2::from_elem((nx, ny), f64::NAN);
        let mut dec = Array2::from_elem((nx, ny), f64::NAN);
        for ((i, j), cell) in ra.indexed_iter_mut() {
            if let Some((long, lat)) = projection.to_world(x[i], y[j]) {
                *cell = long;
                dec[[i, j]] = lat;
            }
        }
        let sky_attrs = attrs! {"units" => "rad", "frame" => params.direction_reference.as_str()};
        xds.add_coord(
            "right_ascension",
            Variable::new(&["l", "m"], ArrayData::from(ra)).with_attrs(sky_attrs.clone()),
        )?;
        xds.add_coord(
            "declination",
            Variable::new(&["l", "m"], ArrayData::from(dec)).with_attrs(sky_attrs),
        )?;
    }

    let phase_center = params.phase_center.to_vec();
    xds.attrs = attrs! {
        "direction" => attrs! {
            "reference" => attrs! {
                "type" => "sky_coord",
                "frame" => params.direction_reference.as_str(),
                "equinox" => "J2000",
                "value" => phase_center.clone(),
                "units" => vec!["rad", "rad"],
                "cdelt" => cdelt.to_vec(),
            },
            "long_pole" => 0.0,
            "lat_pole" => 0.0,
            "pc" => vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            "projection" => params.projection.as_str(),
            "projection_parameters" => vec![0.0, 0.0],
        },
        "active_mask" => "",
        "beam" => AttrValue::Null,
        "object_name" => "",
        "obsdate" => attrs! {
            "scale" => "UTC",
            "format" => "MJD",
            "value" => params.time_coords[0],
            "units" => "d",
        },
        "observer" => "Karl Jansky",
        "pointing_center" => attrs! {"value" => phase_center, "initial" => true},
        "description" => "",
        "telescope" => attrs! {
            "name" => "ALMA",
            "position" => attrs! {
                "type" => "position",
                "ellipsoid" => "GRS80",
                "units" => vec!["rad", "rad", "m"],
                "value" => vec![-1.1825465955049892, -0.3994149869262738, 6379946.01326443],
            },
        },
        "history" => AttrValue::Null,
    };
    Ok(xds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_4;

    fn params() -> SkyImageParams {
        SkyImageParams {
            phase_center: [1.0, -0.5],
            image_size: [4, 3],
            cell_size: [1e-3, 1e-3],
            chan_coords: vec![1.0e9, 1.1e9, 1.2e9],
            pol_coords: vec!["I".into(), "Q".into()],
            time_coords: vec![59000.0],
            ..Default::default()
        }
    }

    fn f64s(xds: &Dataset, name: &str) -> Vec<f64> {
        xds.get(name).unwrap().data.as_f64_vec().unwrap()
    }

    #[test]
    fn test_sin_round_trip() {
        let sin = SinProjection {
            ra0: 1.0,
            dec0: -FRAC_PI_4,
        };
        let (l, m) = sin.to_plane(1.0, -FRAC_PI_4);
        assert_abs_diff_eq!(l, 0.0);
        assert_abs_diff_eq!(m, 0.0);

        for (ra, dec) in [(1.01, -0.8), (0.95, -0.7), (1.2, -0.9)] {
            let (l, m) = sin.to_plane(ra, dec);
            let (ra2, dec2) = sin.to_world(l, m).unwrap();
            assert_abs_diff_eq!(ra2, ra, epsilon = 1e-10);
            assert_abs_diff_eq!(dec2, dec, epsilon = 1e-10);
        }
        assert!(sin.to_world(0.8, 0.8).is_none());
    }

    #[test]
    fn test_coords() {
        let xds = make_empty_sky_image(&params()).unwrap();
        assert!(xds.data_vars.is_empty());
        let dims = xds.dims();
        assert_eq!(dims["l"], 4);
        assert_eq!(dims["m"], 3);
        assert_eq!(dims["frequency"], 3);
        assert_eq!(dims["polarization"], 2);

        assert_eq!(f64s(&xds, "l"), vec![-2e-3, -1e-3, 0.0, 1e-3]);
        assert_eq!(f64s(&xds, "m"), vec![-1e-3, 0.0, 1e-3]);

        let velocity = f64s(&xds, "velocity");
        assert_abs_diff_eq!(velocity[1], 0.0);
        assert_abs_diff_eq!(velocity[0], VEL_C / 11.0, epsilon = 1e-6);
        assert!(velocity[2] < 0.0);

        let freq_attrs = &xds.coords["frequency"].attrs;
        assert_eq!(freq_attrs["frame"].as_str(), Some("LSRK"));
        assert_abs_diff_eq!(freq_attrs["cdelt"].as_f64().unwrap(), 1e8);

        // The centre pixel is the phase centre, and RA decreases with l index.
        let ra = f64s(&xds, "right_ascension");
        let dec = f64s(&xds, "declination");
        assert_abs_diff_eq!(ra[2 * 3 + 1], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(dec[2 * 3 + 1], -0.5, epsilon = 1e-12);
        assert!(ra[3 * 3 + 1] < 1.0);
        assert!(dec[2 * 3 + 2] > -0.5);
    }

    #[test]
    fn test_attrs() {
        let xds = make_empty_sky_image(&params()).unwrap();
        let direction = xds.attrs["direction"].as_map().unwrap();
        let reference = direction["reference"].as_map().unwrap();
        assert_eq!(
            reference["cdelt"],
            AttrValue::from(vec![-1e-3, 1e-3])
        );
        assert_eq!(direction["projection"].as_str(), Some("SIN"));
        let obsdate = xds.attrs["obsdate"].as_map().unwrap();
        assert_eq!(obsdate["value"].as_f64(), Some(59000.0));
        assert_eq!(xds.attrs["beam"], AttrValue::Null);
    }

    #[test]
    fn test_without_sky_coords() {
        let params = SkyImageParams {
            do_sky_coords: false,
            projection: "TAN".into(),
            ..params()
        };
        let xds = make_empty_sky_image(&params).unwrap();
        assert!(xds.get("right_ascension").is_none());
        assert!(xds.get("declination").is_none());
    }

    #[test]
    fn test_bad_params() {
        let result = make_empty_sky_image(&SkyImageParams {
            projection: "TAN".into(),
            ..params()
        });
        assert!(matches!(result, Err(ImageError::UnsupportedProjection(_))));

        let result = make_empty_sky_image(&SkyImageParams {
            chan_coords: vec![],
            ..params()
        });
        assert!(matches!(result, Err(ImageError::Empty("channel"))));

        let result = make_empty_sky_image(&SkyImageParams {
            image_size: [0, 3],
            ..params()
        });
        assert!(matches!(result, Err(ImageError::ZeroSize(_))));
    }
}
