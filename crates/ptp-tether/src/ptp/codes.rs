//! PTP 1.0 operation, response and event codes plus discovery constants.
//!
//! Standard codes live in fixed ranges (0x1000 operations, 0x2000 responses,
//! 0x4000 events). Vendor ranges (0x9000+, 0xA000+, 0xC000+, 0xD000+) are passed
//! through as opaque values, never treated as hard failures.

/// USB interface class triple for PTP still-image devices: (class, subclass, protocol).
pub const STILL_IMAGE_INTERFACE: (u8, u8, u8) = (6, 1, 1);

pub const VENDOR_CANON: u16 = 0x04a9;
pub const VENDOR_NIKON: u16 = 0x04b0;
pub const VENDOR_SONY: u16 = 0x054c;
pub const VENDOR_FUJIFILM: u16 = 0x04cb;
pub const VENDOR_OLYMPUS: u16 = 0x07b4;
pub const VENDOR_PANASONIC: u16 = 0x04da;

/// Default PTP/IP TCP port.
pub const PTPIP_PORT: u16 = 15740;

/// Storage id used when the camera yields no usable list.
pub const DEFAULT_STORAGE_ID: u32 = 0x0001_0001;

/// Returns the camera maker for a USB vendor id, if it's one we know.
pub fn camera_vendor_name(vendor_id: u16) -> Option<&'static str> {
    match vendor_id {
        VENDOR_CANON => Some("Canon"),
        VENDOR_NIKON => Some("Nikon"),
        VENDOR_SONY => Some("Sony"),
        VENDOR_FUJIFILM => Some("Fujifilm"),
        VENDOR_OLYMPUS => Some("Olympus"),
        VENDOR_PANASONIC => Some("Panasonic"),
        _ => None,
    }
}

macro_rules! code_table {
    ($(#[$meta:meta])* $name:ident, $table:ident { $($variant:ident = $value:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum $name {
            $($variant = $value,)+
        }

        impl $name {
            pub fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn code(self) -> u16 {
                self as u16
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant),)+
                }
            }
        }

        static $table: &[(u16, &str)] = &[$(($value, stringify!($variant)),)+];
    };
}

code_table!(
    /// Standard PTP operation codes used by this client.
    OperationCode, OPERATION_NAMES {
        GetDeviceInfo = 0x1001,
        OpenSession = 0x1002,
        CloseSession = 0x1003,
        GetStorageIds = 0x1004,
        GetStorageInfo = 0x1005,
        GetNumObjects = 0x1006,
        GetObjectHandles = 0x1007,
        GetObjectInfo = 0x1008,
        GetObject = 0x1009,
        GetThumb = 0x100a,
        DeleteObject = 0x100b,
        SendObjectInfo = 0x100c,
        SendObject = 0x100d,
        InitiateCapture = 0x100e,
        FormatStore = 0x100f,
        ResetDevice = 0x1010,
        SelfTest = 0x1011,
        SetObjectProtection = 0x1012,
        PowerDown = 0x1013,
        GetDevicePropDesc = 0x1014,
        GetDevicePropValue = 0x1015,
        SetDevicePropValue = 0x1016,
        ResetDevicePropValue = 0x1017,
        TerminateOpenCapture = 0x1018,
        MoveObject = 0x1019,
        CopyObject = 0x101a,
        GetPartialObject = 0x101b,
        InitiateOpenCapture = 0x101c,
    }
);

code_table!(
    /// Standard PTP response codes.
    ResponseCode, RESPONSE_NAMES {
        Undefined = 0x2000,
        Ok = 0x2001,
        GeneralError = 0x2002,
        SessionNotOpen = 0x2003,
        InvalidTransactionId = 0x2004,
        OperationNotSupported = 0x2005,
        ParameterNotSupported = 0x2006,
        IncompleteTransfer = 0x2007,
        InvalidStorageId = 0x2008,
        InvalidObjectHandle = 0x2009,
        DevicePropNotSupported = 0x200a,
        InvalidObjectFormatCode = 0x200b,
        StoreFull = 0x200c,
        ObjectWriteProtected = 0x200d,
        StoreReadOnly = 0x200e,
        AccessDenied = 0x200f,
        NoThumbnailPresent = 0x2010,
        SelfTestFailed = 0x2011,
        PartialDeletion = 0x2012,
        StoreNotAvailable = 0x2013,
        SpecificationByFormatUnsupported = 0x2014,
        NoValidObjectInfo = 0x2015,
        InvalidCodeFormat = 0x2016,
        UnknownVendorCode = 0x2017,
        CaptureAlreadyTerminated = 0x2018,
        DeviceBusy = 0x2019,
        InvalidParentObject = 0x201a,
        InvalidDevicePropFormat = 0x201b,
        InvalidDevicePropValue = 0x201c,
        InvalidParameter = 0x201d,
        SessionAlreadyOpen = 0x201e,
        TransactionCancelled = 0x201f,
        SpecificationOfDestinationUnsupported = 0x2020,
    }
);

code_table!(
    /// Standard PTP event codes.
    EventCode, EVENT_NAMES {
        CancelTransaction = 0x4001,
        ObjectAdded = 0x4002,
        ObjectRemoved = 0x4003,
        StoreAdded = 0x4004,
        StoreRemoved = 0x4005,
        DevicePropChanged = 0x4006,
        ObjectInfoChanged = 0x4007,
        DeviceInfoChanged = 0x4008,
        RequestObjectTransfer = 0x4009,
        StoreFull = 0x400a,
        DeviceReset = 0x400b,
        StorageInfoChanged = 0x400c,
        CaptureComplete = 0x400d,
        UnreportedStatus = 0x400e,
    }
);

/// True for codes in the vendor extension ranges.
pub fn is_vendor_code(code: u16) -> bool {
    matches!(code & 0xf000, 0x9000 | 0xa000 | 0xc000 | 0xd000)
}

fn lookup(table: &[(u16, &'static str)], code: u16) -> Option<&'static str> {
    table.iter().find(|(value, _)| *value == code).map(|(_, name)| *name)
}

fn fallback_name(code: u16) -> String {
    if is_vendor_code(code) {
        format!("Vendor(0x{code:04x})")
    } else {
        format!("Unknown(0x{code:04x})")
    }
}

/// Human-readable operation name for logs.
pub fn operation_name(code: u16) -> String {
    lookup(OPERATION_NAMES, code).map_or_else(|| fallback_name(code), str::to_string)
}

pub fn response_name(code: u16) -> String {
    lookup(RESPONSE_NAMES, code).map_or_else(|| fallback_name(code), str::to_string)
}

pub fn event_name(code: u16) -> String {
    lookup(EVENT_NAMES, code).map_or_else(|| fallback_name(code), str::to_string)
}
