//! Physical device ranking and queue negotiation.
//!
//! This module only works on plain data gathered from the driver
//! ([`AdapterInfo`]), so the whole selection policy can be exercised
//! without a GPU. The device context feeds it real adapters and a closure
//! that creates the logical device for a given [`DevicePlan`].

use crate::queue::QueueKind;
use ash::vk;
use bitflags::bitflags;
use std::ffi::CStr;

/// Extensions needed by the ray tracing capability group.
pub const RAY_TRACING_EXTENSIONS: [&CStr; 8] = [
    ash::khr::spirv_1_4::NAME,
    ash::khr::shader_float_controls::NAME,
    ash::ext::descriptor_indexing::NAME,
    ash::khr::maintenance3::NAME,
    ash::khr::buffer_device_address::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::acceleration_structure::NAME,
];

/// Extensions needed by the mesh shading capability group.
pub const MESH_SHADER_EXTENSIONS: [&CStr; 1] = [ash::nv::mesh_shader::NAME];

/// Rating given to a candidate that lacks a mandatory extension.
pub const INVALID_RATING: u32 = u32::MAX;

/// Priority used for every created queue.
pub const DEFAULT_QUEUE_PRIORITY: f32 = 1.0;

bitflags! {
    /// Set of optional feature groups.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapabilitySet: u32 {
        const RAY_TRACING = 1 << 0;
        const MESH_SHADER = 1 << 1;
    }
}

/// A feature group backed by one or more device extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    RayTracing,
    MeshShader,
}

impl Capability {
    /// Extensions this capability depends on.
    pub fn extensions(self) -> &'static [&'static CStr] {
        match self {
            Self::RayTracing => &RAY_TRACING_EXTENSIONS,
            Self::MeshShader => &MESH_SHADER_EXTENSIONS,
        }
    }

    /// Flag for this capability.
    pub fn flag(self) -> CapabilitySet {
        match self {
            Self::RayTracing => CapabilitySet::RAY_TRACING,
            Self::MeshShader => CapabilitySet::MESH_SHADER,
        }
    }
}

/// Whether a capability must be present for a device to be usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Requirement {
    /// Device creation only succeeds on devices that support it.
    Mandatory,
    /// The capability is silently disabled on devices that lack it.
    #[default]
    Optional,
}

/// Properties of one queue family of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Whether the family can present to the surface in use.
    pub supports_present: bool,
}

/// Everything the selection policy needs to know about a physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    /// Supported device extensions, `None` if they could not be enumerated.
    pub extensions: Option<Vec<String>>,
    pub queue_families: Vec<QueueFamilyInfo>,
}

impl AdapterInfo {
    fn supports(&self, extension: &str) -> bool {
        self.extensions
            .as_ref()
            .is_some_and(|exts| exts.iter().any(|e| e == extension))
    }
}

/// What the application asks of the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionRequest {
    pub graphics_queues: usize,
    pub compute_queues: usize,
    /// Whether a presentation queue (and the swapchain extension) is needed.
    pub present: bool,
    /// Extensions that every candidate must support.
    pub extensions: Vec<String>,
    /// Capability groups that were enabled, with their requirement.
    pub capabilities: Vec<(Capability, Requirement)>,
}

impl SelectionRequest {
    /// Create a request for the given queue mix.
    pub fn new(graphics_queues: usize, compute_queues: usize, present: bool) -> Self {
        Self {
            graphics_queues,
            compute_queues,
            present,
            ..Default::default()
        }
    }

    /// Add a mandatory extension.
    pub fn extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.push(name.into());
        self
    }

    /// Enable a capability group. Enabling it again replaces the requirement.
    pub fn capability(mut self, capability: Capability, requirement: Requirement) -> Self {
        if let Some(entry) = self.capabilities.iter_mut().find(|(c, _)| *c == capability) {
            entry.1 = requirement;
        } else {
            self.capabilities.push((capability, requirement));
        }
        self
    }

    /// Capability groups that were enabled.
    pub fn requested_capabilities(&self) -> CapabilitySet {
        self.capabilities
            .iter()
            .fold(CapabilitySet::empty(), |set, (c, _)| set | c.flag())
    }

    /// Extensions every candidate must support, without duplicates.
    pub fn mandatory_extensions(&self) -> Vec<String> {
        let mut list = Vec::new();
        if self.present {
            push_unique(&mut list, ext_name(ash::khr::swapchain::NAME));
        }
        for extension in &self.extensions {
            push_unique(&mut list, extension.clone());
        }
        for (capability, requirement) in &self.capabilities {
            if *requirement == Requirement::Mandatory {
                for extension in capability.extensions() {
                    push_unique(&mut list, ext_name(extension));
                }
            }
        }
        list
    }

    /// Extensions that may be missing, without duplicates.
    ///
    /// An extension shared by several optional groups appears once; one that
    /// is already mandatory is not optional.
    pub fn optional_extensions(&self) -> Vec<String> {
        let mandatory = self.mandatory_extensions();
        let mut list = Vec::new();
        for (capability, requirement) in &self.capabilities {
            if *requirement == Requirement::Optional {
                for extension in capability.extensions() {
                    let name = ext_name(extension);
                    if !mandatory.contains(&name) {
                        push_unique(&mut list, name);
                    }
                }
            }
        }
        list
    }

    fn queue_total(&self) -> usize {
        self.graphics_queues + self.compute_queues + usize::from(self.present)
    }
}

fn push_unique(list: &mut Vec<String>, name: String) {
    if !list.contains(&name) {
        list.push(name);
    }
}

/// Convert a Vulkan extension name constant to an owned string.
pub fn ext_name(name: &CStr) -> String {
    name.to_string_lossy().into_owned()
}

/// Result of checking a candidate's extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rating {
    /// Every mandatory extension is present.
    Usable {
        /// One entry per optional extension, `true` when it is missing.
        missing: Vec<bool>,
    },
    /// A mandatory extension is missing, or extensions could not be listed.
    Invalid { missing_mandatory: Vec<String> },
}

impl Rating {
    /// Number of missing optional extensions, or [`INVALID_RATING`].
    pub fn value(&self) -> u32 {
        match self {
            Self::Usable { missing } => missing.iter().filter(|m| **m).count() as u32,
            Self::Invalid { .. } => INVALID_RATING,
        }
    }
}

/// Check one adapter against the mandatory and optional extension lists.
pub fn rate_adapter(adapter: &AdapterInfo, mandatory: &[String], optional: &[String]) -> Rating {
    if adapter.extensions.is_none() {
        return Rating::Invalid {
            missing_mandatory: Vec::new(),
        };
    }

    let missing_mandatory: Vec<String> = mandatory
        .iter()
        .filter(|e| !adapter.supports(e))
        .cloned()
        .collect();
    if !missing_mandatory.is_empty() {
        return Rating::Invalid { missing_mandatory };
    }

    Rating::Usable {
        missing: optional.iter().map(|e| !adapter.supports(e)).collect(),
    }
}

/// Queue family chosen for every requested logical queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueAssignment {
    pub graphics: Vec<u32>,
    pub compute: Vec<u32>,
    pub present: Option<u32>,
}

impl QueueAssignment {
    /// Family indices in request order: graphics, compute, then present.
    pub fn families(&self) -> impl Iterator<Item = u32> + '_ {
        self.graphics
            .iter()
            .chain(self.compute.iter())
            .copied()
            .chain(self.present)
    }

    /// Family of the queue the command pool is created for.
    pub fn command_pool_family(&self) -> Option<u32> {
        self.graphics.first().or(self.compute.first()).copied()
    }
}

/// First family with at least one queue whose flags contain `flags`.
pub fn find_queue_family(families: &[QueueFamilyInfo], flags: vk::QueueFlags) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_count > 0 && f.flags.contains(flags))
        .map(|i| i as u32)
}

/// First family with at least one queue that can present.
pub fn find_present_family(families: &[QueueFamilyInfo]) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_count > 0 && f.supports_present)
        .map(|i| i as u32)
}

/// First family able to serve a queue of `kind`.
pub fn find_family(families: &[QueueFamilyInfo], kind: QueueKind) -> Option<u32> {
    match kind.required_flags() {
        Some(flags) => find_queue_family(families, flags),
        None => find_present_family(families),
    }
}

/// Resolve a family for every requested queue, or report the first kind
/// that cannot be satisfied.
pub fn resolve_queues(
    adapter: &AdapterInfo,
    request: &SelectionRequest,
) -> Result<QueueAssignment, QueueKind> {
    let families = &adapter.queue_families;
    let resolve = |kind| find_family(families, kind).ok_or(kind);
    let mut assignment = QueueAssignment::default();

    for _ in 0..request.graphics_queues {
        assignment.graphics.push(resolve(QueueKind::Graphics)?);
    }

    for _ in 0..request.compute_queues {
        assignment.compute.push(resolve(QueueKind::Compute)?);
    }

    if request.present {
        assignment.present = Some(resolve(QueueKind::Present)?);
    }

    Ok(assignment)
}

/// One entry of the device queue create info list.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueCreateEntry {
    pub family_index: u32,
    pub priorities: Vec<f32>,
}

/// Build the queue create entries for an assignment.
///
/// The first queue always gets an entry. Every later queue only gets one
/// if no earlier entry already uses its family, so a family appears at
/// most once. Expected queue counts are tiny, hence the pairwise scan.
pub fn queue_create_entries(assignment: &QueueAssignment) -> Vec<QueueCreateEntry> {
    let mut entries: Vec<QueueCreateEntry> = Vec::new();

    for family in assignment.families() {
        if entries.iter().any(|e| e.family_index == family) {
            continue;
        }
        entries.push(QueueCreateEntry {
            family_index: family,
            priorities: vec![DEFAULT_QUEUE_PRIORITY],
        });
    }

    entries
}

/// Everything needed to create the logical device on one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePlan {
    /// Index of the adapter in enumeration order.
    pub adapter_index: usize,
    pub queues: QueueAssignment,
    pub queue_create_entries: Vec<QueueCreateEntry>,
    /// Mandatory extensions followed by the supported optional ones.
    pub enabled_extensions: Vec<String>,
    /// Optional extensions the candidate does not support.
    pub missing_optional_extensions: Vec<String>,
    /// Capability groups that were enabled.
    pub requested: CapabilitySet,
    /// Capability groups that survived the candidate's extension support.
    pub available: CapabilitySet,
}

impl DevicePlan {
    pub fn ray_tracing_available(&self) -> bool {
        self.available.contains(CapabilitySet::RAY_TRACING)
    }

    pub fn mesh_shader_available(&self) -> bool {
        self.available.contains(CapabilitySet::MESH_SHADER)
    }

    /// Requested capabilities that were disabled on this candidate.
    pub fn downgraded(&self) -> CapabilitySet {
        self.requested - self.available
    }
}

/// Build the plan for a usable candidate whose queues were resolved.
pub fn build_plan(
    adapter_index: usize,
    request: &SelectionRequest,
    optional: &[String],
    missing: &[bool],
    queues: QueueAssignment,
) -> DevicePlan {
    let mut enabled_extensions = request.mandatory_extensions();
    let mut missing_optional_extensions = Vec::new();
    for (extension, is_missing) in optional.iter().zip(missing) {
        if *is_missing {
            missing_optional_extensions.push(extension.clone());
        } else {
            enabled_extensions.push(extension.clone());
        }
    }

    let requested = request.requested_capabilities();
    let mut available = requested;
    for (capability, requirement) in &request.capabilities {
        if *requirement == Requirement::Optional
            && capability
                .extensions()
                .iter()
                .any(|e| missing_optional_extensions.contains(&ext_name(e)))
        {
            available.remove(capability.flag());
        }
    }

    DevicePlan {
        adapter_index,
        queue_create_entries: queue_create_entries(&queues),
        queues,
        enabled_extensions,
        missing_optional_extensions,
        requested,
        available,
    }
}

/// Why a candidate was or was not selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// The logical device was created on this candidate.
    Valid,
    /// A mandatory extension is missing. An empty list means the extension
    /// query itself failed.
    MissingMandatory { extensions: Vec<String> },
    /// No queue family could serve a requested queue kind.
    QueueResolutionFailed(QueueKind),
    /// The driver refused to create the logical device.
    DeviceCreationFailed(vk::Result),
}

/// Outcome for one examined candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateReport {
    pub adapter_index: usize,
    pub name: String,
    pub rating: u32,
    pub outcome: CandidateOutcome,
}

/// The selected candidate and what was created on it.
#[derive(Debug)]
pub struct Selected<T> {
    pub plan: DevicePlan,
    pub device: T,
}

/// Result of running the selection over every adapter.
#[derive(Debug)]
pub struct Negotiation<T> {
    /// Examined candidates, in the order they were tried.
    pub report: Vec<CandidateReport>,
    pub selected: Option<Selected<T>>,
}

/// Rank every adapter and create the logical device on the first viable one.
///
/// Candidates are ordered by their number of missing optional extensions
/// (ties keep enumeration order) and tried one after another. `create` is
/// called with the plan of each candidate whose queues could be resolved;
/// the first success ends the search. A failed candidate leaves nothing
/// behind, so the search simply moves on.
pub fn negotiate<T, F>(
    adapters: &[AdapterInfo],
    request: &SelectionRequest,
    mut create: F,
) -> Negotiation<T>
where
    F: FnMut(&AdapterInfo, &DevicePlan) -> Result<T, vk::Result>,
{
    let mandatory = request.mandatory_extensions();
    let optional = request.optional_extensions();

    let mut candidates: Vec<(usize, Rating)> = adapters
        .iter()
        .enumerate()
        .map(|(i, adapter)| (i, rate_adapter(adapter, &mandatory, &optional)))
        .collect();
    candidates.sort_by_key(|(_, rating)| rating.value());

    let mut report = Vec::with_capacity(candidates.len());

    for (index, rating) in candidates {
        let adapter = &adapters[index];
        let mut entry = CandidateReport {
            adapter_index: index,
            name: adapter.name.clone(),
            rating: rating.value(),
            outcome: CandidateOutcome::Valid,
        };

        let missing = match rating {
            Rating::Usable { missing } => missing,
            Rating::Invalid { missing_mandatory } => {
                entry.outcome = CandidateOutcome::MissingMandatory {
                    extensions: missing_mandatory,
                };
                report.push(entry);
                continue;
            }
        };

        let queues = match resolve_queues(adapter, request) {
            Ok(queues) => queues,
            Err(kind) => {
                entry.outcome = CandidateOutcome::QueueResolutionFailed(kind);
                report.push(entry);
                continue;
            }
        };
        debug_assert!(queues.families().count() == request.queue_total());

        let plan = build_plan(index, request, &optional, &missing, queues);
        match create(adapter, &plan) {
            Ok(device) => {
                report.push(entry);
                return Negotiation {
                    report,
                    selected: Some(Selected { plan, device }),
                };
            }
            Err(result) => {
                entry.outcome = CandidateOutcome::DeviceCreationFailed(result);
                report.push(entry);
            }
        }
    }

    Negotiation {
        report,
        selected: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_family(present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            queue_count: 16,
            supports_present: present,
        }
    }

    fn adapter(name: &str, extensions: &[&CStr]) -> AdapterInfo {
        AdapterInfo {
            name: name.to_string(),
            extensions: Some(extensions.iter().map(|e| ext_name(e)).collect()),
            queue_families: vec![full_family(true)],
        }
    }

    fn with_rt(name: &str) -> AdapterInfo {
        let mut exts = vec![ash::khr::swapchain::NAME];
        exts.extend(RAY_TRACING_EXTENSIONS);
        adapter(name, &exts)
    }

    fn always_create(_: &AdapterInfo, plan: &DevicePlan) -> Result<usize, vk::Result> {
        Ok(plan.adapter_index)
    }

    #[test]
    fn fewest_missing_optional_wins() {
        let adapters = vec![
            adapter("no-rt", &[ash::khr::swapchain::NAME]),
            with_rt("rt"),
        ];
        let request = SelectionRequest::new(1, 0, true)
            .capability(Capability::RayTracing, Requirement::Optional);

        let negotiation = negotiate(&adapters, &request, always_create);
        let selected = negotiation.selected.unwrap();
        assert_eq!(selected.device, 1);
        assert!(selected.plan.ray_tracing_available());
        assert_eq!(negotiation.report[0].rating, 0);
    }

    #[test]
    fn ties_keep_enumeration_order() {
        let adapters = vec![with_rt("first"), with_rt("second")];
        let request = SelectionRequest::new(1, 0, true)
            .capability(Capability::RayTracing, Requirement::Optional);

        let negotiation = negotiate(&adapters, &request, always_create);
        assert_eq!(negotiation.selected.unwrap().device, 0);
    }

    #[test]
    fn missing_mandatory_is_never_selected() {
        let adapters = vec![
            adapter("headless-only", &[]),
            adapter("partial", &[ash::khr::swapchain::NAME]),
        ];
        let request = SelectionRequest::new(1, 0, true)
            .capability(Capability::RayTracing, Requirement::Mandatory);

        let mut attempts = 0;
        let negotiation = negotiate(&adapters, &request, |a, p| {
            attempts += 1;
            always_create(a, p)
        });

        assert!(negotiation.selected.is_none());
        assert_eq!(attempts, 0);
        assert_eq!(negotiation.report.len(), 2);
        for entry in &negotiation.report {
            assert_eq!(entry.rating, INVALID_RATING);
            assert!(matches!(
                entry.outcome,
                CandidateOutcome::MissingMandatory { .. }
            ));
        }
    }

    #[test]
    fn invalid_candidates_sort_last() {
        let adapters = vec![adapter("invalid", &[]), with_rt("valid")];
        let request = SelectionRequest::new(1, 0, true);

        let negotiation = negotiate(&adapters, &request, always_create);
        assert_eq!(negotiation.report.len(), 1);
        assert_eq!(negotiation.report[0].name, "valid");
        assert_eq!(negotiation.selected.unwrap().device, 1);
    }

    #[test]
    fn failed_extension_query_invalidates() {
        let mut broken = with_rt("broken");
        broken.extensions = None;
        let mandatory = vec![ext_name(ash::khr::swapchain::NAME)];
        let rating = rate_adapter(&broken, &mandatory, &[]);
        assert_eq!(rating.value(), INVALID_RATING);
        assert_eq!(
            rating,
            Rating::Invalid {
                missing_mandatory: vec![]
            }
        );
    }

    #[test]
    fn device_creation_failure_moves_to_next_candidate() {
        let adapters = vec![with_rt("flaky"), with_rt("stable")];
        let request = SelectionRequest::new(1, 1, false);

        let negotiation = negotiate(&adapters, &request, |_, plan| {
            if plan.adapter_index == 0 {
                Err(vk::Result::ERROR_INITIALIZATION_FAILED)
            } else {
                Ok(plan.adapter_index)
            }
        });

        assert_eq!(negotiation.selected.unwrap().device, 1);
        assert_eq!(
            negotiation.report[0].outcome,
            CandidateOutcome::DeviceCreationFailed(vk::Result::ERROR_INITIALIZATION_FAILED)
        );
        assert_eq!(negotiation.report[1].outcome, CandidateOutcome::Valid);
    }

    #[test]
    fn unresolvable_queue_skips_candidate() {
        let mut compute_only = with_rt("compute-only");
        compute_only.queue_families = vec![QueueFamilyInfo {
            flags: vk::QueueFlags::COMPUTE,
            queue_count: 1,
            supports_present: false,
        }];
        let adapters = vec![compute_only, with_rt("full")];
        let request = SelectionRequest::new(1, 0, true);

        let negotiation = negotiate(&adapters, &request, always_create);
        assert_eq!(
            negotiation.report[0].outcome,
            CandidateOutcome::QueueResolutionFailed(QueueKind::Graphics)
        );
        assert_eq!(negotiation.selected.unwrap().device, 1);
    }

    #[test]
    fn present_resolution_uses_surface_support() {
        let mut adapter = with_rt("split");
        adapter.queue_families = vec![full_family(false), full_family(true)];
        let request = SelectionRequest::new(1, 0, true);

        let queues = resolve_queues(&adapter, &request).unwrap();
        assert_eq!(queues.graphics, vec![0]);
        assert_eq!(queues.present, Some(1));

        adapter.queue_families = vec![full_family(false)];
        assert_eq!(
            resolve_queues(&adapter, &request),
            Err(QueueKind::Present)
        );
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [
            QueueFamilyInfo {
                flags: vk::QueueFlags::GRAPHICS,
                queue_count: 0,
                supports_present: true,
            },
            full_family(true),
        ];
        assert_eq!(find_queue_family(&families, vk::QueueFlags::GRAPHICS), Some(1));
        assert_eq!(find_present_family(&families), Some(1));
    }

    #[test]
    fn family_lookup_follows_queue_kind() {
        let families = [
            QueueFamilyInfo {
                flags: vk::QueueFlags::COMPUTE,
                queue_count: 2,
                supports_present: false,
            },
            QueueFamilyInfo {
                flags: vk::QueueFlags::GRAPHICS,
                queue_count: 1,
                supports_present: false,
            },
            QueueFamilyInfo {
                flags: vk::QueueFlags::TRANSFER,
                queue_count: 1,
                supports_present: true,
            },
        ];
        assert_eq!(find_family(&families, QueueKind::Graphics), Some(1));
        assert_eq!(find_family(&families, QueueKind::Compute), Some(0));
        assert_eq!(find_family(&families, QueueKind::Present), Some(2));
    }

    #[test]
    fn separate_families_rank_and_deduplicate() {
        let families = vec![
            QueueFamilyInfo {
                flags: vk::QueueFlags::GRAPHICS,
                queue_count: 4,
                supports_present: false,
            },
            QueueFamilyInfo {
                flags: vk::QueueFlags::COMPUTE,
                queue_count: 4,
                supports_present: false,
            },
            QueueFamilyInfo {
                flags: vk::QueueFlags::TRANSFER,
                queue_count: 1,
                supports_present: true,
            },
        ];
        let mut mesh_only = adapter("mesh-only", &[ash::khr::swapchain::NAME]);
        mesh_only.extensions = mesh_only.extensions.map(|mut exts| {
            exts.extend(MESH_SHADER_EXTENSIONS.iter().map(|e| ext_name(e)));
            exts
        });
        mesh_only.queue_families = families.clone();
        let mut rt_only = with_rt("rt-only");
        rt_only.queue_families = families;

        let request = SelectionRequest::new(2, 2, true)
            .capability(Capability::RayTracing, Requirement::Optional)
            .capability(Capability::MeshShader, Requirement::Optional);

        let negotiation = negotiate(&[mesh_only, rt_only], &request, always_create);
        let selected = negotiation.selected.unwrap();
        assert_eq!(selected.device, 1);

        let families: Vec<_> = selected
            .plan
            .queue_create_entries
            .iter()
            .map(|e| e.family_index)
            .collect();
        assert_eq!(families, vec![0, 1, 2]);
        assert_eq!(selected.plan.available, CapabilitySet::RAY_TRACING);
    }

    #[test]
    fn shared_family_yields_single_entry() {
        let adapter = with_rt("unified");
        for graphics in 0..4 {
            for compute in 0..4 {
                for present in [false, true] {
                    if graphics + compute == 0 {
                        continue;
                    }
                    let request = SelectionRequest::new(graphics, compute, present);
                    let queues = resolve_queues(&adapter, &request).unwrap();
                    let entries = queue_create_entries(&queues);
                    assert_eq!(entries.len(), 1, "{graphics} {compute} {present}");
                    assert_eq!(entries[0].family_index, 0);
                    assert_eq!(entries[0].priorities, vec![DEFAULT_QUEUE_PRIORITY]);
                }
            }
        }
    }

    #[test]
    fn entries_match_distinct_families() {
        let assignment = QueueAssignment {
            graphics: vec![0, 0],
            compute: vec![2, 0, 2],
            present: Some(1),
        };
        let families: Vec<u32> = queue_create_entries(&assignment)
            .iter()
            .map(|e| e.family_index)
            .collect();
        assert_eq!(families, vec![0, 2, 1]);
    }

    #[test]
    fn first_compute_queue_is_considered_after_graphics() {
        let assignment = QueueAssignment {
            graphics: vec![0],
            compute: vec![1],
            present: None,
        };
        let entries = queue_create_entries(&assignment);
        assert_eq!(entries.len(), 2);
        assert_eq!(assignment.command_pool_family(), Some(0));
    }

    #[test]
    fn present_shares_compute_family() {
        let assignment = QueueAssignment {
            graphics: vec![],
            compute: vec![3],
            present: Some(3),
        };
        assert_eq!(queue_create_entries(&assignment).len(), 1);
        assert_eq!(assignment.command_pool_family(), Some(3));
    }

    #[test]
    fn unsupported_optional_matches_no_optional() {
        let plain = adapter("plain", &[ash::khr::swapchain::NAME]);
        let adapters = vec![plain];

        let bare = SelectionRequest::new(1, 0, true);
        let optional = SelectionRequest::new(1, 0, true)
            .capability(Capability::RayTracing, Requirement::Optional)
            .capability(Capability::MeshShader, Requirement::Optional);

        let bare_plan = negotiate(&adapters, &bare, always_create)
            .selected
            .unwrap()
            .plan;
        let optional_plan = negotiate(&adapters, &optional, always_create)
            .selected
            .unwrap()
            .plan;

        assert_eq!(bare_plan.enabled_extensions, optional_plan.enabled_extensions);
        assert_eq!(
            bare_plan.enabled_extensions,
            vec![ext_name(ash::khr::swapchain::NAME)]
        );
        assert_eq!(bare_plan.queue_create_entries, optional_plan.queue_create_entries);
        assert!(optional_plan.available.is_empty());
        assert_eq!(
            optional_plan.downgraded(),
            CapabilitySet::RAY_TRACING | CapabilitySet::MESH_SHADER
        );
        assert_eq!(optional_plan.missing_optional_extensions.len(), 9);
    }

    #[test]
    fn partial_group_support_disables_only_that_group() {
        let mut exts = vec![ash::khr::swapchain::NAME];
        exts.extend(RAY_TRACING_EXTENSIONS);
        let adapters = vec![adapter("rt-no-mesh", &exts)];
        let request = SelectionRequest::new(1, 0, true)
            .capability(Capability::RayTracing, Requirement::Optional)
            .capability(Capability::MeshShader, Requirement::Optional);

        let plan = negotiate(&adapters, &request, always_create)
            .selected
            .unwrap()
            .plan;
        assert!(plan.ray_tracing_available());
        assert!(!plan.mesh_shader_available());
        assert_eq!(plan.enabled_extensions.len(), 1 + RAY_TRACING_EXTENSIONS.len());
        assert_eq!(
            plan.missing_optional_extensions,
            vec![ext_name(ash::nv::mesh_shader::NAME)]
        );
    }

    #[test]
    fn one_missing_extension_disables_group() {
        let exts: Vec<&CStr> = RAY_TRACING_EXTENSIONS[..7].to_vec();
        let adapters = vec![adapter("almost", &exts)];
        let request = SelectionRequest::new(0, 1, false)
            .capability(Capability::RayTracing, Requirement::Optional);

        let plan = negotiate(&adapters, &request, always_create)
            .selected
            .unwrap()
            .plan;
        assert!(!plan.ray_tracing_available());
        assert_eq!(plan.enabled_extensions.len(), 7);
    }

    #[test]
    fn headless_needs_no_swapchain() {
        let request = SelectionRequest::new(0, 2, false);
        assert!(request.mandatory_extensions().is_empty());

        let windowed = SelectionRequest::new(1, 0, true);
        assert_eq!(
            windowed.mandatory_extensions(),
            vec![ext_name(ash::khr::swapchain::NAME)]
        );
    }

    #[test]
    fn mandatory_capability_is_not_optional() {
        let request = SelectionRequest::new(1, 0, false)
            .capability(Capability::RayTracing, Requirement::Optional)
            .capability(Capability::RayTracing, Requirement::Mandatory);
        assert_eq!(request.capabilities.len(), 1);
        assert!(request.optional_extensions().is_empty());
        assert_eq!(
            request.mandatory_extensions().len(),
            RAY_TRACING_EXTENSIONS.len()
        );
    }

    #[test]
    fn duplicate_mandatory_extensions_collapse() {
        let request = SelectionRequest::new(1, 0, true).extension("VK_KHR_swapchain");
        assert_eq!(request.mandatory_extensions().len(), 1);
    }
}
