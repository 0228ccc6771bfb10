//! Decoding of raw USB descriptors
//!
//! Field layouts follow USB 2.0 chapter 9.6 and DFU 1.1 section 4.1.3.
//! Everything here is a pure function of the input bytes.

use crate::error::DfuError;

pub(crate) const DT_DEVICE: u8 = 0x01;
pub(crate) const DT_CONFIGURATION: u8 = 0x02;
pub(crate) const DT_STRING: u8 = 0x03;
pub(crate) const DT_INTERFACE: u8 = 0x04;
pub(crate) const DFU_DESC_TYPE: u8 = 0x21;

pub(crate) const DEVICE_DESC_LEN: usize = 18;
pub(crate) const CONFIG_DESC_LEN: usize = 9;
pub(crate) const INTERFACE_DESC_LEN: usize = 9;
pub(crate) const DFU_DESC_LEN: usize = 9;

pub const DFU_CLASS: u8 = 0xFE;
pub const DFU_SUBCLASS: u8 = 0x01;
pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
pub const DFU_PROTOCOL_DFU_MODE: u8 = 0x02;

pub const DFUSE_VERSION_NUMBER: u16 = 0x11A;

fn le16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn check_len(data: &[u8], len: usize, what: &str) -> Result<(), DfuError> {
    if data.len() < len {
        Err(DfuError::Format(format!(
            "{what} descriptor too short: {} bytes, expected {len}",
            data.len()
        )))
    } else {
        Ok(())
    }
}

/// Standard device descriptor (USB 2.0, table 9-8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DfuError> {
        check_len(data, DEVICE_DESC_LEN, "Device")?;
        Ok(DeviceDescriptor {
            length: data[0],
            descriptor_type: data[1],
            usb_version: le16(data, 2),
            device_class: data[4],
            device_subclass: data[5],
            device_protocol: data[6],
            max_packet_size: data[7],
            vendor_id: le16(data, 8),
            product_id: le16(data, 10),
            device_version: le16(data, 12),
            manufacturer_index: data[14],
            product_index: data[15],
            serial_number_index: data[16],
            num_configurations: data[17],
        })
    }
}

/// Standard configuration descriptor (USB 2.0, table 9-10) together with
/// every descriptor that follows it in the `GET_DESCRIPTOR` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    /// Flat list of sub-descriptors, in byte order.
    pub descriptors: Vec<Descriptor>,
}

impl ConfigurationDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DfuError> {
        check_len(data, CONFIG_DESC_LEN, "Configuration")?;
        Ok(ConfigurationDescriptor {
            length: data[0],
            descriptor_type: data[1],
            total_length: le16(data, 2),
            num_interfaces: data[4],
            configuration_value: data[5],
            configuration_index: data[6],
            attributes: data[7],
            max_power: data[8],
            descriptors: parse_sub_descriptors(&data[CONFIG_DESC_LEN..])?,
        })
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.descriptors.iter().filter_map(|desc| match desc {
            Descriptor::Interface(intf) => Some(intf),
            _ => None,
        })
    }

    /// Find the alternate setting `alt_setting` of interface `interface`.
    pub fn interface(
        &self,
        interface: u8,
        alt_setting: u8,
    ) -> Option<&InterfaceDescriptor> {
        self.interfaces().find(|intf| {
            intf.interface_number == interface
                && intf.alternate_setting == alt_setting
        })
    }
}

/// Standard interface descriptor (USB 2.0, table 9-12)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_index: u8,
    /// Descriptors nested under this interface, in byte order.
    pub descriptors: Vec<Descriptor>,
}

impl InterfaceDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DfuError> {
        check_len(data, INTERFACE_DESC_LEN, "Interface")?;
        Ok(InterfaceDescriptor {
            length: data[0],
            descriptor_type: data[1],
            interface_number: data[2],
            alternate_setting: data[3],
            num_endpoints: data[4],
            interface_class: data[5],
            interface_subclass: data[6],
            interface_protocol: data[7],
            interface_index: data[8],
            descriptors: Vec::new(),
        })
    }

    /// Class and subclass identify a DFU interface (either protocol).
    pub fn is_dfu(&self) -> bool {
        self.interface_class == DFU_CLASS
            && self.interface_subclass == DFU_SUBCLASS
    }

    pub fn dfu_descriptor(&self) -> Option<&DfuDescriptor> {
        self.descriptors.iter().find_map(|desc| match desc {
            Descriptor::DfuFunctional(dfu) => Some(dfu),
            _ => None,
        })
    }
}

/// DFU functional descriptor
///
/// Represents the DFU functional descriptor as described in section 4.1.3.
///
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DfuDescriptor {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl DfuDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    pub fn parse(data: &[u8]) -> Result<Self, DfuError> {
        check_len(data, DFU_DESC_LEN, "DFU functional")?;
        Ok(Self {
            attributes: data[2],
            detach_timeout: le16(data, 3),
            transfer_size: le16(data, 5),
            dfu_version: le16(data, 7),
        })
    }

    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    /// Download capable (`bitCanDnload`)
    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// Upload capable (`bitCanUpload`)
    #[doc(alias = "bitCanUpload")]
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// Device is able to communicate via USB after
    /// Manifestation phase (`bitManifestationTolerant`)
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device will perform a bus detach-attach sequence when it receives
    /// a `DFU_DETACH` request (`bitWillDetach`). The host must not issue a USB Reset.
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// Time, in milliseconds, that the device will wait after receipt of the `DFU_DETACH`
    /// request (`wDetachTimeOut`).
    #[doc(alias = "wDetachTimeout")]
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Maximum number of bytes that the device can accept per control-write transaction
    /// (`wTransferSize`).
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Numeric expression identifying the version of the DFU Specification release
    /// (`bcdDFUVersion`).
    #[doc(alias = "bcdDFUVersion")]
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }

    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_VERSION_NUMBER
    }
}

/// Any descriptor without a dedicated decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Interface(InterfaceDescriptor),
    DfuFunctional(DfuDescriptor),
    Generic(GenericDescriptor),
}

impl Descriptor {
    pub fn descriptor_type(&self) -> u8 {
        match self {
            Descriptor::Interface(_) => DT_INTERFACE,
            Descriptor::DfuFunctional(_) => DFU_DESC_TYPE,
            Descriptor::Generic(desc) => desc.descriptor_type,
        }
    }
}

/// Split the bytes following a configuration descriptor header.
///
/// Returns the flat list in byte order. Every descriptor that is not an
/// interface is also attached to the interface descriptor that most
/// recently preceded it. A trailing fragment shorter than 3 bytes is
/// ignored.
pub fn parse_sub_descriptors(data: &[u8]) -> Result<Vec<Descriptor>, DfuError> {
    let mut remaining = data;
    let mut descriptors = Vec::new();
    let mut current_intf: Option<usize> = None;
    let mut in_dfu_intf = false;

    while remaining.len() > 2 {
        let length = remaining[0] as usize;
        let descriptor_type = remaining[1];
        if length < 2 || length > remaining.len() {
            return Err(DfuError::Format(format!(
                "bad descriptor length {length} with {} bytes left",
                remaining.len()
            )));
        }
        let desc_data = &remaining[..length];

        if descriptor_type == DT_INTERFACE {
            let intf = InterfaceDescriptor::parse(desc_data)?;
            in_dfu_intf = intf.is_dfu();
            current_intf = Some(descriptors.len());
            descriptors.push(Descriptor::Interface(intf));
        } else {
            let desc = if in_dfu_intf && descriptor_type == DFU_DESC_TYPE {
                Descriptor::DfuFunctional(DfuDescriptor::parse(desc_data)?)
            } else {
                Descriptor::Generic(GenericDescriptor {
                    length: length as u8,
                    descriptor_type,
                    data: desc_data.to_vec(),
                })
            };
            if let Some(Descriptor::Interface(intf)) =
                current_intf.and_then(|idx| descriptors.get_mut(idx))
            {
                intf.descriptors.push(desc.clone());
            }
            descriptors.push(desc);
        }

        remaining = &remaining[length..];
    }

    Ok(descriptors)
}

/// Decoded string descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringDescriptor {
    /// Answer to a request for index 0 / language 0.
    Languages(Vec<u16>),
    Text(String),
}

/// Decode a string descriptor returned for `lang_id`.
///
/// `bLength` is taken from the first byte; the content holds
/// `(bLength - 2) / 2` UTF-16 code units.
pub fn parse_string_descriptor(
    data: &[u8],
    lang_id: u16,
) -> Result<StringDescriptor, DfuError> {
    let length = *data.first().ok_or_else(|| {
        DfuError::Format("empty string descriptor".to_string())
    })? as usize;
    if length < 2 || data.len() < length {
        return Err(DfuError::Format(format!(
            "string descriptor length {length} with {} bytes",
            data.len()
        )));
    }
    let words: Vec<u16> = data[2..length]
        .chunks_exact(2)
        .map(|w| u16::from_le_bytes([w[0], w[1]]))
        .collect();
    Ok(if lang_id == 0 {
        StringDescriptor::Languages(words)
    } else {
        StringDescriptor::Text(String::from_utf16_lossy(&words))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DFU_INTF: [u8; 9] = [9, 4, 0, 0, 0, 0xFE, 0x01, 0x02, 4];
    const DFU_FUNC: [u8; 9] = [9, 0x21, 0x0b, 0xff, 0x00, 0x00, 0x08, 0x1a, 0x01];

    fn config_bytes(body: &[&[u8]]) -> Vec<u8> {
        let total: usize = 9 + body.iter().map(|b| b.len()).sum::<usize>();
        let mut data = vec![9, 2, total as u8, (total >> 8) as u8, 1, 1, 0, 0xc0, 50];
        for part in body {
            data.extend_from_slice(part);
        }
        data
    }

    #[test]
    fn test_device_descriptor() {
        let raw = [
            18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x83, 0x04, 0x11, 0xdf, 0x00,
            0x22, 1, 2, 3, 1,
        ];
        let desc = DeviceDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.usb_version, 0x0200);
        assert_eq!(desc.vendor_id, 0x0483);
        assert_eq!(desc.product_id, 0xdf11);
        assert_eq!(desc.device_version, 0x2200);
        assert_eq!(desc.serial_number_index, 3);
        assert_eq!(desc.num_configurations, 1);

        assert!(matches!(
            DeviceDescriptor::parse(&raw[..10]),
            Err(DfuError::Format(_))
        ));
    }

    #[test]
    fn test_dfu_functional_descriptor() {
        let desc = DfuDescriptor::parse(&DFU_FUNC).unwrap();
        assert!(desc.can_download());
        assert!(desc.can_upload());
        assert!(!desc.manifestation_tolerant());
        assert!(desc.will_detach());
        assert_eq!(desc.detach_timeout(), 0xff);
        assert_eq!(desc.transfer_size(), 2048);
        assert_eq!(desc.dfu_version(), 0x11a);
        assert!(desc.is_dfuse());
    }

    #[test]
    fn test_configuration_nesting() {
        let other_intf = [9, 4, 1, 0, 1, 0x03, 0x00, 0x00, 0];
        let endpoint = [7, 5, 0x81, 3, 8, 0, 10];
        let data = config_bytes(&[
            &DFU_INTF,
            &DFU_FUNC,
            &other_intf,
            &DFU_FUNC,
            &endpoint,
        ]);

        let config = ConfigurationDescriptor::parse(&data).unwrap();
        assert_eq!(config.total_length as usize, data.len());
        assert_eq!(config.configuration_value, 1);
        assert_eq!(config.descriptors.len(), 5);

        let intfs: Vec<_> = config.interfaces().collect();
        assert_eq!(intfs.len(), 2);
        assert_eq!(
            intfs[0].descriptors,
            vec![Descriptor::DfuFunctional(
                DfuDescriptor::parse(&DFU_FUNC).unwrap()
            )]
        );
        assert!(intfs[0].dfu_descriptor().is_some());

        // 0x21 outside a DFU interface stays generic but is still nested
        assert_eq!(intfs[1].descriptors.len(), 2);
        assert!(intfs[1].dfu_descriptor().is_none());
        assert_eq!(
            intfs[1].descriptors[0],
            Descriptor::Generic(GenericDescriptor {
                length: 9,
                descriptor_type: 0x21,
                data: DFU_FUNC.to_vec(),
            })
        );
        assert_eq!(intfs[1].descriptors[1].descriptor_type(), 5);

        assert!(config.interface(0, 0).is_some_and(|i| i.is_dfu()));
        assert!(config.interface(1, 1).is_none());
    }

    #[test]
    fn test_child_counts_match_flat_list() {
        let endpoint = [7, 5, 0x01, 2, 64, 0, 0];
        let data = config_bytes(&[
            &[5, 0x24, 0, 0x10, 0x01],
            &DFU_INTF,
            &DFU_FUNC,
            &endpoint,
            &[9, 4, 0, 1, 0, 0xFE, 0x01, 0x02, 5],
            &DFU_FUNC,
        ]);
        let descriptors = parse_sub_descriptors(&data[9..]).unwrap();

        let nested: usize = descriptors
            .iter()
            .filter_map(|d| match d {
                Descriptor::Interface(intf) => Some(intf.descriptors.len()),
                _ => None,
            })
            .sum();
        // the leading class descriptor has no interface to belong to
        let non_interface = descriptors
            .iter()
            .filter(|d| d.descriptor_type() != DT_INTERFACE)
            .count();
        assert_eq!(nested, non_interface - 1);

        assert_eq!(descriptors, parse_sub_descriptors(&data[9..]).unwrap());
    }

    #[test]
    fn test_truncated_tail_is_tolerated() {
        let mut body = DFU_INTF.to_vec();
        body.extend_from_slice(&[9, 0x21]);
        let descriptors = parse_sub_descriptors(&body).unwrap();
        assert_eq!(descriptors.len(), 1);
    }

    #[test]
    fn test_malformed_lengths() {
        assert!(matches!(
            parse_sub_descriptors(&[0, 4, 0, 0]),
            Err(DfuError::Format(_))
        ));
        assert!(matches!(
            parse_sub_descriptors(&[9, 4, 0, 0]),
            Err(DfuError::Format(_))
        ));
        // DFU functional descriptor cut short inside a DFU interface
        let mut body = DFU_INTF.to_vec();
        body.extend_from_slice(&[5, 0x21, 0, 0, 0]);
        assert!(matches!(
            parse_sub_descriptors(&body),
            Err(DfuError::Format(_))
        ));
    }

    #[test]
    fn test_string_descriptors() {
        let langs = parse_string_descriptor(&[4, 3, 0x09, 0x04], 0).unwrap();
        assert_eq!(langs, StringDescriptor::Languages(vec![0x0409]));

        let name = [10, 3, b'@', 0, b'F', 0, b'l', 0, b'/', 0];
        assert_eq!(
            parse_string_descriptor(&name, 0x0409).unwrap(),
            StringDescriptor::Text("@Fl/".to_string())
        );

        assert!(parse_string_descriptor(&[], 0x0409).is_err());
        assert!(parse_string_descriptor(&[10, 3, 0, 0], 0x0409).is_err());
    }
}
