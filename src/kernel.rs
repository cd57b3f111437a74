/// Thread block geometry for a verification run.
/// Every thread of one block is emulated, identified by its thread/block
/// coordinates, following the CUDA execution model.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VerifyError;
use crate::warp::WARP_SIZE;

/// 3D dimension struct used for block and grid sizes (mirrors CUDA's dim3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    /// Convenience constructor for 1D configs
    pub fn x(x: u32) -> Self {
        Dim3 { x, y: 1, z: 1 }
    }

    /// Total number of threads/blocks in this dimension.
    /// Only meaningful for shapes already accepted by `checked_size`.
    pub fn size(&self) -> u32 {
        self.x.wrapping_mul(self.y).wrapping_mul(self.z)
    }

    /// Total size, or None when it is zero or does not fit in a u32
    pub fn checked_size(&self) -> Option<u32> {
        self.x
            .checked_mul(self.y)
            .and_then(|xy| xy.checked_mul(self.z))
            .filter(|&n| n != 0)
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Dim3::x(1)
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Parses `N`, `XxY` or `XxYxZ`.
impl FromStr for Dim3 {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VerifyError::InvalidThreadCount(s.to_string());
        let parts: Vec<u32> = s
            .split(['x', 'X', ','])
            .map(|p| p.trim().parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        let dim = match parts.as_slice() {
            [x] => Dim3::x(*x),
            [x, y] => Dim3::new(*x, *y, 1),
            [x, y, z] => Dim3::new(*x, *y, *z),
            _ => return Err(invalid()),
        };
        dim.checked_size().ok_or_else(invalid)?;
        Ok(dim)
    }
}

/// Geometry of the single thread block being verified, plus the block's
/// position in the grid (only observable through %ctaid / %nctaid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLayout {
    pub block_dim: Dim3,
    pub block_idx: Dim3,
    pub grid_dim: Dim3,
}

impl BlockLayout {
    pub fn new(block_dim: Dim3) -> Self {
        BlockLayout {
            block_dim,
            block_idx: Dim3::new(0, 0, 0),
            grid_dim: Dim3::x(1),
        }
    }

    /// Total number of threads in the block
    pub fn threads(&self) -> usize {
        self.block_dim.size() as usize
    }

    /// Number of warps, the last one possibly partial
    pub fn warps(&self) -> usize {
        self.threads().div_ceil(WARP_SIZE)
    }

    /// Thread coordinates of a flat thread id
    pub fn thread_idx(&self, flat: usize) -> Dim3 {
        flat_to_dim3(flat as u32, self.block_dim)
    }
}

/// Convert a flat thread index into a Dim3 given block dimensions.
pub fn flat_to_dim3(flat: u32, block_dim: Dim3) -> Dim3 {
    let x = flat % block_dim.x;
    let y = (flat / block_dim.x) % block_dim.y;
    let z = flat / (block_dim.x * block_dim.y);
    Dim3::new(x, y, z)
}
