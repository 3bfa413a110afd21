//! The dependency graph of steps the poller schedules work into.


use crate::sets::Micrograph;


pub type StepId = usize;


#[derive(Debug, Clone, PartialEq)]
pub enum Step {
	/// run the external estimator over one micrograph
	Estimate(Micrograph),
	/// add one micrograph's result to the output set
	Publish(Micrograph),
	/// close the output stream, once the input stream has closed and everything is published
	CloseOutput
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
	New,
	/// not runnable yet, even if all its prerequisites are done
	Waiting,
	Running,
	Finished,
	Failed
}

impl StepStatus {

	/// Failed steps count as done too: what depends on them still gets to run.
	pub fn is_done(&self) -> bool {
		matches!(self, Self::Finished | Self::Failed)
	}
}


/// What the poller needs from an execution engine.
pub trait Engine {
	fn insert(&mut self, step: Step, prerequisites: &[StepId]) -> StepId;
	fn insert_waiting(&mut self, step: Step) -> StepId;
	fn add_prerequisite(&mut self, id: StepId, prerequisite: StepId);
	fn status(&self, id: StepId) -> Option<StepStatus>;
	fn set_status(&mut self, id: StepId, status: StepStatus);
}


struct Entry {
	step: Step,
	prerequisites: Vec<StepId>,
	status: StepStatus
}


/// An in-memory step graph. Steps are never removed, so ids stay valid for the life of a run.
pub struct Steps {
	entries: Vec<Entry>
}

impl Steps {

	pub fn new() -> Self {
		Self {
			entries: Vec::new()
		}
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn step(&self, id: StepId) -> Option<&Step> {
		self.entries.get(id)
			.map(|e| &e.step)
	}

	pub fn prerequisites(&self, id: StepId) -> &[StepId] {
		self.entries.get(id)
			.map(|e| e.prerequisites.as_slice())
			.unwrap_or_default()
	}

	/// new steps whose prerequisites are all done, in insertion order
	pub fn ready(&self) -> Vec<StepId> {
		self.entries.iter()
			.enumerate()
			.filter(|(_, e)| e.status == StepStatus::New)
			.filter(|(_, e)| e.prerequisites.iter()
				.all(|p| self.entries[*p].status.is_done())
			)
			.map(|(id, _)| id)
			.collect()
	}

	pub fn count(&self, status: StepStatus) -> usize {
		self.entries.iter()
			.filter(|e| e.status == status)
			.count()
	}

	fn push(&mut self, step: Step, prerequisites: &[StepId], status: StepStatus) -> StepId {
		let id = self.entries.len();
		self.entries.push(Entry {
			step,
			prerequisites: prerequisites.to_vec(),
			status
		});
		tracing::trace!("Inserted step {}: {:?}, after {:?}", id, &self.entries[id].step, prerequisites);
		id
	}
}

impl Engine for Steps {

	fn insert(&mut self, step: Step, prerequisites: &[StepId]) -> StepId {
		self.push(step, prerequisites, StepStatus::New)
	}

	fn insert_waiting(&mut self, step: Step) -> StepId {
		self.push(step, &[], StepStatus::Waiting)
	}

	fn add_prerequisite(&mut self, id: StepId, prerequisite: StepId) {
		if let Some(entry) = self.entries.get_mut(id) {
			if !entry.prerequisites.contains(&prerequisite) {
				entry.prerequisites.push(prerequisite);
			}
		}
	}

	fn status(&self, id: StepId) -> Option<StepStatus> {
		self.entries.get(id)
			.map(|e| e.status)
	}

	fn set_status(&mut self, id: StepId, status: StepStatus) {
		if let Some(entry) = self.entries.get_mut(id) {
			entry.status = status;
		}
	}
}
