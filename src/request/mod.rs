//! Request aggregate - domain model for requests, actions and reviews.

pub mod types;

pub use types::{
    AcceptInfo, Action, ActionKind, Approval, Coordinate, GroupId, Priority, Request,
    RequestNumber, RequestState, Review, ReviewHistoryElement, ReviewState, ReviewerRef, UserId,
};
