// Primitive number types that can be viewed from raw bytes.
pub trait Align1: bytemuck::Pod {}

impl Align1 for u8 {}
impl Align1 for u32 {}
impl Align1 for u64 {}
impl Align1 for f32 {}
impl Align1 for f64 {}

// Receive buffers must be 8 bytes aligned so `f64` payloads can be borrowed in place.
pub trait Align8: Align1 {}

impl Align8 for u64 {}
impl Align8 for f64 {}
