pub mod alpaca;
pub mod broker;
pub mod paper;

pub use alpaca::AlpacaClient;
pub use broker::{
    BrokerAck, BrokerClient, BrokerOrder, BrokerPosition, BrokerResult, OrderLookup,
    OrderStatusFilter, PositionListing, RawBrokerOrder, RawBrokerPosition, SubmitOrder,
};
pub use paper::{PaperBroker, PaperSubmission};
