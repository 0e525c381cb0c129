/// Declares a wire enum whose unknown raw values survive decoding.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident: $repr:ty {
            $($variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
            Unknown($repr),
        }

        impl From<$repr> for $name {
            fn from(raw: $repr) -> Self {
                match raw {
                    $($value => $name::$variant,)+
                    other => $name::Unknown(other),
                }
            }
        }

        impl From<$name> for $repr {
            fn from(value: $name) -> Self {
                match value {
                    $($name::$variant => $value,)+
                    $name::Unknown(other) => other,
                }
            }
        }
    };
}

wire_enum! {
    pub enum EndpointId: u8 {
        System = 0,
        Security = 1,
        Bluetooth = 2,
        RailDownstream = 3,
        RailUpstream = 4,
        Zigbee = 5,
        Zwave = 6,
        Connect = 7,
        Gpio = 8,
        OpenThread = 9,
        WiSun = 10,
        Wifi = 11,
        Ieee802154 = 12,
        Cli = 13,
        BluetoothRcp = 14,
        Acp = 15,
    }
}

wire_enum! {
    pub enum UnnumberedFrameCommandId: u8 {
        Noop = 0x00,
        Reset = 0x01,
        PropValueGet = 0x02,
        PropValueSet = 0x03,
        PropValueIs = 0x06,
        Invalid = 0xFF,
    }
}

impl UnnumberedFrameCommandId {
    /// Commands whose payload is a [`super::PropertyCommand`].
    pub fn carries_property(&self) -> bool {
        matches!(
            self,
            UnnumberedFrameCommandId::PropValueGet
                | UnnumberedFrameCommandId::PropValueSet
                | UnnumberedFrameCommandId::PropValueIs
        )
    }
}

wire_enum! {
    pub enum PropertyId: u32 {
        LastStatus = 0x00,
        ProtocolVersion = 0x01,
        Capabilities = 0x02,
        SecondaryCpcVersion = 0x03,
        SecondaryAppVersion = 0x04,
        RxCapability = 0x20,
        FcValidationValue = 0x30,
        BusSpeedValue = 0x40,
        BootloaderInfo = 0x200,
        BootloaderRebootMode = 0x202,
        CoreDebugCounters = 0x400,
        UframeProcessing = 0x500,
    }
}

wire_enum! {
    pub enum RebootMode: u32 {
        Application = 0,
        Bootloader = 1,
    }
}
