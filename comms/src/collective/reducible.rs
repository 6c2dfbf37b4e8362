use crate::msg::Payload;

/// The element types a collective can reduce.
///
/// Sums are always accumulated in `f64` and in rank order, so every rank ends
/// up with bit-identical results.
pub(super) trait Reducible: Copy {
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
    fn payload(nums: &[Self]) -> Payload<'_>;
    fn from_payload(payload: Payload<'_>) -> Option<&[Self]>;
}

impl Reducible for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn payload(nums: &[Self]) -> Payload<'_> {
        Payload::Single(nums)
    }

    fn from_payload(payload: Payload<'_>) -> Option<&[Self]> {
        match payload {
            Payload::Single(nums) => Some(nums),
            Payload::Double(_) => None,
        }
    }
}

impl Reducible for f64 {
    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn payload(nums: &[Self]) -> Payload<'_> {
        Payload::Double(nums)
    }

    fn from_payload(payload: Payload<'_>) -> Option<&[Self]> {
        match payload {
            Payload::Double(nums) => Some(nums),
            Payload::Single(_) => None,
        }
    }
}
