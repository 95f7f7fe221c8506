pub mod actormodel;
pub mod escrowmodel;
pub mod milestonemodel;
