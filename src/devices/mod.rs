//! Devices the core talks to directly. The PIC and PIT live with the
//! interrupt and timer code; what remains here is debug output.

pub mod serial;
