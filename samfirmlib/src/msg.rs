use crate::crypto::FusCrypto;

use std::path::Path;

use xmltree::{Element, XMLNode};

/// Builder for the XML request bodies sent to the binary inform and init
/// endpoints.
pub trait MessageBuilder: Send + Sync {
    /// Body for `NF_DownloadBinaryInform.do`. `version` is the four-field
    /// request version.
    fn build_inform_request(
        &self,
        version: &str,
        region: &str,
        model: &str,
        imei: &str,
        decrypted_nonce: &str,
    ) -> Element;

    /// Body for `NF_DownloadBinaryInitForMass.do`.
    fn build_init_request(&self, filename: &str, decrypted_nonce: &str) -> Element;
}

/// Default message layout, as sent by the official desktop client for
/// factory (full) firmware.
pub struct FusMessageBuilder<C> {
    crypto: C,
}

impl<C: FusCrypto> FusMessageBuilder<C> {
    pub fn new(crypto: C) -> Self {
        Self { crypto }
    }

    fn create_text_node(name: &str, text: &str) -> XMLNode {
        let mut elem = Element::new(name);
        elem.children.push(XMLNode::Text(text.to_owned()));
        XMLNode::Element(elem)
    }

    fn create_data_node(name: &str, value: &str) -> XMLNode {
        let mut elem = Element::new(name);
        elem.children.push(Self::create_text_node("Data", value));
        XMLNode::Element(elem)
    }

    fn create_fus_hdr_node() -> XMLNode {
        let mut elem = Element::new("FUSHdr");
        elem.children.push(Self::create_text_node("ProtoVer", "1.0"));
        XMLNode::Element(elem)
    }

    fn wrap_body(put: Element, get: Element) -> Element {
        let mut fus_body = Element::new("FUSBody");
        fus_body.children.push(XMLNode::Element(put));
        fus_body.children.push(XMLNode::Element(get));

        let mut fus_msg = Element::new("FUSMsg");
        fus_msg.children.push(Self::create_fus_hdr_node());
        fus_msg.children.push(XMLNode::Element(fus_body));

        fus_msg
    }

    /// The part of a filename used for the init logic check: everything
    /// before the first `.`, limited to the last 16 characters.
    fn filename_logic_input(filename: &str) -> &str {
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(filename);
        let stem = name.split('.').next().unwrap_or(name);

        match stem.char_indices().rev().nth(15) {
            Some((i, _)) => &stem[i..],
            None => stem,
        }
    }
}

impl<C: FusCrypto> MessageBuilder for FusMessageBuilder<C> {
    fn build_inform_request(
        &self,
        version: &str,
        region: &str,
        model: &str,
        imei: &str,
        decrypted_nonce: &str,
    ) -> Element {
        let mut put = Element::new("Put");
        put.children.push(Self::create_data_node("ACCESS_MODE", "2"));
        put.children.push(Self::create_data_node("BINARY_NATURE", "1"));
        put.children.push(Self::create_data_node("CLIENT_PRODUCT", "Smart Switch"));
        put.children.push(Self::create_data_node("CLIENT_VERSION", "4.3.23123_1"));
        put.children.push(Self::create_data_node("DEVICE_IMEI_PUSH", imei));
        put.children.push(Self::create_data_node("DEVICE_FW_VERSION", version));
        put.children.push(Self::create_data_node("DEVICE_LOCAL_CODE", region));
        put.children.push(Self::create_data_node("DEVICE_MODEL_NAME", model));
        put.children.push(Self::create_data_node("LOGIC_CHECK",
            &self.crypto.logic_check(version, decrypted_nonce)));

        // Multi-CSC European regions are only served with a carrier identity
        let carrier = match region {
            "EUX" => Some(("DE", "262")),
            "EUY" => Some(("RS", "220")),
            _ => None,
        };
        if let Some((cc, mcc)) = carrier {
            put.children.push(Self::create_data_node("DEVICE_AID_CODE", region));
            put.children.push(Self::create_data_node("DEVICE_CC_CODE", cc));
            put.children.push(Self::create_data_node("MCC_NUM", mcc));
            put.children.push(Self::create_data_node("MNC_NUM", "01"));
        }

        let mut get = Element::new("Get");
        get.children.push(Self::create_text_node("CmdID", "2"));
        get.children.push(Self::create_text_node("LATEST_FW_VERSION", ""));

        Self::wrap_body(put, get)
    }

    fn build_init_request(&self, filename: &str, decrypted_nonce: &str) -> Element {
        let mut put = Element::new("Put");
        put.children.push(Self::create_data_node("BINARY_FILE_NAME", filename));
        put.children.push(Self::create_data_node("LOGIC_CHECK",
            &self.crypto.logic_check(Self::filename_logic_input(filename), decrypted_nonce)));

        let mut get = Element::new("Get");
        get.children.push(Self::create_text_node("CmdID", "2"));
        get.children.push(Self::create_text_node("LATEST_FW_VERSION", ""));

        Self::wrap_body(put, get)
    }
}
