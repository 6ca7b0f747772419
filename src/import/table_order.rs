use crate::entity::EntityType;

const ROOT_LEVEL: u8 = 1;
const FLEET_LEVEL: u8 = 2;
const OPERATIONS_LEVEL: u8 = 3;
const BILLING_LEVEL: u8 = 4;

/// Dependency tier of an entity. Every entity only references entities in
/// strictly lower levels.
pub fn level_of(entity: EntityType) -> u8 {
    match entity {
        EntityType::Operators
        | EntityType::VehicleTypes
        | EntityType::Shifts
        | EntityType::Users
        | EntityType::Routes => ROOT_LEVEL,
        EntityType::Vehicles | EntityType::Drivers => FLEET_LEVEL,
        EntityType::VehicleBadges | EntityType::DispatchRecords => OPERATIONS_LEVEL,
        EntityType::Invoices => BILLING_LEVEL,
    }
}

/// Entities grouped by level, lowest level first, in deterministic order
/// within each level.
pub fn import_levels() -> Vec<(u8, Vec<EntityType>)> {
    let mut levels: Vec<(u8, Vec<EntityType>)> = Vec::new();
    for entity in EntityType::ALL {
        let level = level_of(entity);
        match levels.iter_mut().find(|(existing, _)| *existing == level) {
            Some((_, members)) => members.push(entity),
            None => levels.push((level, vec![entity])),
        }
    }
    levels.sort_by_key(|(level, _)| *level);
    levels
}

/// Children before parents: the reverse of the flattened import order.
pub fn rollback_order() -> Vec<EntityType> {
    let mut order: Vec<EntityType> = import_levels()
        .into_iter()
        .flat_map(|(_, members)| members)
        .collect();
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[EntityType], entity: EntityType) -> usize {
        order
            .iter()
            .position(|candidate| *candidate == entity)
            .expect("entity present in order")
    }

    #[test]
    fn levels_follow_dependency_tiers() {
        let levels = import_levels();
        let numbers: Vec<u8> = levels.iter().map(|(level, _)| *level).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(
            levels[1].1,
            vec![EntityType::Vehicles, EntityType::Drivers]
        );
        assert_eq!(levels[3].1, vec![EntityType::Invoices]);
    }

    #[test]
    fn rollback_clears_children_first() {
        let order = rollback_order();
        assert_eq!(order.first(), Some(&EntityType::Invoices));
        assert_eq!(order.last(), Some(&EntityType::Operators));
        assert!(
            position(&order, EntityType::Invoices) < position(&order, EntityType::DispatchRecords)
        );
        assert!(
            position(&order, EntityType::DispatchRecords) < position(&order, EntityType::Vehicles)
        );
        assert!(
            position(&order, EntityType::DispatchRecords) < position(&order, EntityType::Drivers)
        );
        assert!(position(&order, EntityType::Vehicles) < position(&order, EntityType::Operators));
        assert!(position(&order, EntityType::Drivers) < position(&order, EntityType::Operators));
    }
}
