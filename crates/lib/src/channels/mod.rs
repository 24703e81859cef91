//! Messaging channels: provisioned channel instances, the inbound message shape,
//! and the outbound messaging-gateway client.

mod inbound;
mod messaging;
mod registry;

pub use inbound::{endpoint_number, InboundData, InboundMessage, MessageKey};
pub use messaging::{GatewayError, HttpMessagingGateway, MediaFile, MessagingGateway, MENU_TEXT};
pub use registry::{ChannelGroup, ChannelInstance, ChannelRegistry, ChannelRegistryError};
