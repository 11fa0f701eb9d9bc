//! Host-side utilities for serial port selection.
//!
//! The command line addresses a port by its index in [`KNOWN_PORTS`], a fixed
//! table of the usual Unix serial device paths.

/// Known serial device paths, addressed by index.
pub const KNOWN_PORTS: [&str; 38] = [
    "/dev/ttyS0",
    "/dev/ttyS1",
    "/dev/ttyS2",
    "/dev/ttyS3",
    "/dev/ttyS4",
    "/dev/ttyS5",
    "/dev/ttyS6",
    "/dev/ttyS7",
    "/dev/ttyS8",
    "/dev/ttyS9",
    "/dev/ttyS10",
    "/dev/ttyS11",
    "/dev/ttyS12",
    "/dev/ttyS13",
    "/dev/ttyS14",
    "/dev/ttyS15",
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/ttyUSB2",
    "/dev/ttyUSB3",
    "/dev/ttyUSB4",
    "/dev/ttyUSB5",
    "/dev/ttyAMA0",
    "/dev/ttyAMA1",
    "/dev/ttyACM0",
    "/dev/ttyACM1",
    "/dev/rfcomm0",
    "/dev/rfcomm1",
    "/dev/ircomm0",
    "/dev/ircomm1",
    "/dev/cuau0",
    "/dev/cuau1",
    "/dev/cuau2",
    "/dev/cuau3",
    "/dev/cuaU0",
    "/dev/cuaU1",
    "/dev/cuaU2",
    "/dev/cuaU3",
];

/// Device path for a port index.
#[must_use]
pub fn port_path(index: usize) -> Option<&'static str> {
    KNOWN_PORTS.get(index).copied()
}

/// Index of a device path in [`KNOWN_PORTS`].
#[must_use]
pub fn port_index(path: &str) -> Option<usize> {
    KNOWN_PORTS.iter().position(|p| *p == path)
}

/// Serial ports present on this machine.
#[cfg(feature = "native")]
pub fn discover_ports() -> crate::Result<Vec<crate::port::PortInfo>> {
    crate::port::NativePort::list_ports()
}
