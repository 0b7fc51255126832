use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Body rotation axis handled by the stabilizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub enum Axis {
    Roll,
    Pitch,
    Yaw,
}

impl Axis {
    /// Processing order of a control tick.
    pub const ALL: [Axis; 3] = [Axis::Roll, Axis::Pitch, Axis::Yaw];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn is_yaw(self) -> bool {
        matches!(self, Axis::Yaw)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::Roll => "roll",
            Axis::Pitch => "pitch",
            Axis::Yaw => "yaw",
        };
        f.write_str(name)
    }
}

/// Fixed roll/pitch/yaw container indexed by [`Axis`].
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Encode, Decode, Serialize, Deserialize,
)]
pub struct AxisArray<T: 'static>(pub [T; 3]);

impl<T> AxisArray<T> {
    pub const fn new(roll: T, pitch: T, yaw: T) -> Self {
        Self([roll, pitch, yaw])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Axis, &T)> {
        Axis::ALL.into_iter().zip(self.0.iter())
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> AxisArray<U> {
        AxisArray([f(&self.0[0]), f(&self.0[1]), f(&self.0[2])])
    }
}

impl<T: Copy> AxisArray<T> {
    pub const fn splat(value: T) -> Self {
        Self([value; 3])
    }
}

impl<T> Index<Axis> for AxisArray<T> {
    type Output = T;

    fn index(&self, axis: Axis) -> &T {
        &self.0[axis.index()]
    }
}

impl<T> IndexMut<Axis> for AxisArray<T> {
    fn index_mut(&mut self, axis: Axis) -> &mut T {
        &mut self.0[axis.index()]
    }
}
