use std::fmt;

/// Operating modes of a gateway port.
///
/// The gateway decides which modes a physical port supports; configuring an
/// unsupported mode is answered with an `ERROR` reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PortMode {
    /// The port is not configured.
    #[default]
    Unused,
    /// Digital input.
    DigitalIn,
    /// Digital output.
    DigitalOut,
    /// Analog input.
    AnalogIn,
    /// Analog output.
    AnalogOut,
    /// Edge interrupt source.
    Interrupt,
    /// Pulse-width modulated output.
    Pwm,
}

impl PortMode {
    /// Returns the mode name as sent on the wire.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Unused => "UNUSED",
            Self::DigitalIn => "DIGITAL_IN",
            Self::DigitalOut => "DIGITAL_OUT",
            Self::AnalogIn => "ANALOG_IN",
            Self::AnalogOut => "ANALOG_OUT",
            Self::Interrupt => "INTERRUPT",
            Self::Pwm => "PWM",
        }
    }
}

impl fmt::Display for PortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Pull resistor configuration of a gateway port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PullMode {
    /// No pull resistor.
    #[default]
    None,
    /// Pull-up resistor.
    Up,
    /// Pull-down resistor.
    Down,
}

impl PullMode {
    /// Returns the pull mode name as sent on the wire.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Up => "UP",
            Self::Down => "DOWN",
        }
    }
}

impl fmt::Display for PullMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}
