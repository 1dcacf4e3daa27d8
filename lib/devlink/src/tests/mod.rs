//! Scenario tests driving the graph through a stand-in driver model.

mod fw;
