//! Image geometries of the supported datasets.
//!
//! Loading and augmenting images is left to the caller. A [`Dataset`] only fixes the shape of
//! the images and the shape they are fitted to before entering a network.
use crate::{
    error::{configuration_error, shape_error},
    learn::neural_network::topology::NetworkTopology,
};
use anyhow::Result;
use ndarray::{s, Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Retinal and angiographic datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    /// DRIVE fundus images.
    #[display(fmt = "drive")]
    Drive,
    /// STARE fundus images.
    #[display(fmt = "stare")]
    Stare,
    /// CHASE_DB1 fundus images.
    #[display(fmt = "chase")]
    Chase,
    /// Digital subtraction angiography.
    #[display(fmt = "dsa")]
    Dsa,
}

impl FromStr for Dataset {
    type Err = anyhow::Error;
    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "drive" => Ok(Self::Drive),
            "stare" => Ok(Self::Stare),
            "chase" => Ok(Self::Chase),
            "dsa" => Ok(Self::Dsa),
            _ => Err(configuration_error!("dataset {name:?} not recognized")),
        }
    }
}

impl Dataset {
    /// Every dataset.
    pub const ALL: [Self; 4] = [Self::Drive, Self::Stare, Self::Chase, Self::Dsa];
    /// Images have a single channel.
    pub const IMAGE_CHANNELS: usize = 1;
    /// The shape of the images, `[height, width, channels]`.
    pub fn image_shape(&self) -> [usize; 3] {
        let [height, width] = match self {
            Self::Drive => [584, 565],
            Self::Stare => [605, 700],
            Self::Chase => [960, 999],
            Self::Dsa => [1024, 1024],
        };
        [height, width, Self::IMAGE_CHANNELS]
    }
    /// The shape images are padded to, `[height, width, channels]`.
    pub fn fit_shape(&self) -> [usize; 3] {
        let [height, width] = match self {
            Self::Drive => [584, 584],
            Self::Stare => [704, 704],
            Self::Chase | Self::Dsa => [1024, 1024],
        };
        [height, width, Self::IMAGE_CHANNELS]
    }
    /// The network family used for the dataset.
    ///
    /// DSA uses the large family with skip connections, the fundus datasets the small family.
    pub fn topology(&self) -> NetworkTopology {
        match self {
            Self::Dsa => NetworkTopology::large(),
            _ => NetworkTopology::small(),
        }
    }
    /// Zero pads a batch of images to the fit shape, the images occupy the top left corner.
    ///
    /// **Errors**
    ///
    /// [`Error::Shape`](crate::error::Error::Shape) if the images do not have the image shape.
    pub fn fit(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch, height, width, channels) = images.dim();
        if [height, width, channels] != self.image_shape() {
            return Err(shape_error!(
                "{self} images are {:?}, found {:?}",
                self.image_shape(),
                images.shape()
            ));
        }
        let [fit_height, fit_width, _] = self.fit_shape();
        let mut output = Array4::zeros([batch, fit_height, fit_width, channels]);
        output
            .slice_mut(s![.., ..height, ..width, ..])
            .assign(&images);
        Ok(output)
    }
    /// Crops a batch fitted with [`fit()`](Self::fit) back to the image shape.
    ///
    /// **Errors**
    ///
    /// [`Error::Shape`](crate::error::Error::Shape) if the batch does not have the fit shape.
    pub fn crop<'a>(&self, fitted: ArrayView4<'a, f32>) -> Result<ArrayView4<'a, f32>> {
        if fitted.shape()[1..] != self.fit_shape() {
            return Err(shape_error!(
                "{self} fitted images are {:?}, found {:?}",
                self.fit_shape(),
                fitted.shape()
            ));
        }
        let [height, width, _] = self.image_shape();
        Ok(fitted.slice_move(s![.., ..height, ..width, ..]))
    }
}
